use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use chrono::Utc;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use consulta_services::live::registry::{AudioRoute, Peer, Role, Room};
use consulta_services::live::transcode::{self, TranscodeEvent};
use consulta_services::live::turns::{TurnAssembler, TurnOutput};
use consulta_services::live::recognizer::{self, RecognizerEvent};
use consulta_services::live::{Outbound, OutboundReceiver, close_code};

use super::protocol::{ClientFrame, ServerFrame};
use crate::state::AppState;

/// Which endpoint the socket arrived on; decides the expected hello.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Intake {
    Host,
    Patient,
}

/// Everything a connection owns once its handshake succeeded.
struct Session {
    room: Arc<Room>,
    peer: Arc<Peer>,
    /// Recognizer/transcoder pump tasks, aborted on cleanup.
    pumps: Vec<tokio::task::JoinHandle<()>>,
    last_alive: Arc<Mutex<Instant>>,
}

/// One connection, start to finish: writer task, handshake, active message
/// loop, heartbeat, and the teardown cascade for its role.
pub async fn run(socket: WebSocket, state: AppState, intake: Intake) {
    let (ws_tx, mut ws_rx) = socket.split();
    let (out_tx, out_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut writer = tokio::spawn(write_loop(ws_tx, out_rx));
    let mut writer_done = false;

    if let Some(session) = handshake(&state, &mut ws_rx, &out_tx, intake).await {
        let heartbeat = spawn_heartbeat(&state, &session);
        // A server-initiated close (heartbeat timeout, eviction, room
        // teardown, upstream failure) ends the writer. Racing it against
        // the read loop means a hung peer that never completes the close
        // handshake still hits cleanup immediately.
        let leave_reason = tokio::select! {
            reason = active_loop(&state, &session, &mut ws_rx) => reason,
            sent = &mut writer => {
                writer_done = true;
                match sent {
                    Ok(Some(close_code::TIMEOUT)) => "timeout",
                    _ => "closed",
                }
            }
        };
        heartbeat.abort();
        cleanup(&state, &session, leave_reason);
        for pump in &session.pumps {
            pump.abort();
        }
    }

    // Dropping the last sender ends the writer; wait so the close frame
    // (if any) actually goes out before the socket is dropped.
    drop(out_tx);
    if !writer_done {
        let _ = writer.await;
    }
}

/// Drains the outbound channel into the socket sink. Serializes all sends
/// for this connection. `Close` ends the loop; the code it carried is
/// returned so `run` can attribute the disconnect.
async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut out_rx: OutboundReceiver,
) -> Option<u16> {
    while let Some(outbound) = out_rx.recv().await {
        let result = match outbound {
            Outbound::Frame(json) => ws_tx.send(Message::text(json)).await,
            Outbound::Pong(payload) => ws_tx.send(Message::Pong(payload.into())).await,
            Outbound::Close { code, reason } => {
                let _ = ws_tx
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                return Some(code);
            }
        };
        if result.is_err() {
            break;
        }
    }
    None
}

fn send_frame(out_tx: &consulta_services::live::OutboundSender, frame: &ServerFrame) {
    let _ = out_tx.send(Outbound::Frame(frame.to_json()));
}

fn send_close(out_tx: &consulta_services::live::OutboundSender, code: u16, reason: &str) {
    let _ = out_tx.send(Outbound::Close {
        code,
        reason: reason.to_string(),
    });
}

/// Awaits the first control frame and wires up the room and pipelines.
///
/// Binary frames before the hello are dropped silently; any other control
/// frame is a protocol violation and closes the socket. Returns `None`
/// when the connection ended without a valid handshake.
async fn handshake(
    state: &AppState,
    ws_rx: &mut SplitStream<WebSocket>,
    out_tx: &consulta_services::live::OutboundSender,
    intake: Intake,
) -> Option<Session> {
    loop {
        let message = match ws_rx.next().await? {
            Ok(m) => m,
            Err(e) => {
                debug!(%e, "socket error before handshake");
                return None;
            }
        };

        match message {
            // Audio before the handshake: drop, keep the socket open.
            Message::Binary(_) => continue,
            Message::Ping(payload) => {
                let _ = out_tx.send(Outbound::Pong(payload.to_vec()));
                continue;
            }
            Message::Pong(_) => continue,
            Message::Close(_) => return None,
            Message::Text(text) => {
                let frame = match serde_json::from_str::<ClientFrame>(text.as_str()) {
                    Ok(f) => f,
                    Err(e) => {
                        debug!(%e, "malformed handshake frame");
                        send_close(out_tx, close_code::PROTOCOL_ERROR, "invalid handshake");
                        return None;
                    }
                };

                return match (intake, frame) {
                    (
                        Intake::Host,
                        ClientFrame::Hello {
                            token,
                            mime_type,
                            sample_rate,
                        },
                    ) => host_hello(state, out_tx, token, mime_type, sample_rate).await,
                    (
                        Intake::Patient,
                        ClientFrame::HelloPatient {
                            room_id,
                            join_token,
                            mime_type,
                            sample_rate,
                        },
                    ) => {
                        patient_hello(state, out_tx, room_id, join_token, mime_type, sample_rate)
                            .await
                    }
                    _ => {
                        send_close(out_tx, close_code::PROTOCOL_ERROR, "expected hello");
                        None
                    }
                };
            }
        }
    }
}

async fn host_hello(
    state: &AppState,
    out_tx: &consulta_services::live::OutboundSender,
    token: String,
    mime_type: String,
    sample_rate: u32,
) -> Option<Session> {
    let claims = match state.auth.verify_access_token(&token) {
        Ok(c) => c,
        Err(e) => {
            debug!(%e, "host token rejected");
            send_frame(out_tx, &ServerFrame::error("token inválido"));
            send_close(out_tx, close_code::AUTH_FAILURE, "auth failure");
            return None;
        }
    };

    let peer = Arc::new(Peer::new(
        Role::Host,
        mime_type,
        sample_rate,
        out_tx.clone(),
        state.settings.live.pending_audio_max_frames,
    ));
    let room = state.rooms.create_room(peer.clone());
    info!(room_id = %room.room_id, user = %claims.sub, "host connected");

    let pumps = start_pipeline(state, &room, &peer);

    send_frame(
        out_tx,
        &ServerFrame::Ready {
            role: Role::Host,
            room_id: room.room_id.clone(),
            join_token: Some(room.join_token.clone()),
        },
    );

    Some(Session {
        room,
        peer,
        pumps,
        last_alive: Arc::new(Mutex::new(Instant::now())),
    })
}

async fn patient_hello(
    state: &AppState,
    out_tx: &consulta_services::live::OutboundSender,
    room_id: String,
    join_token: String,
    mime_type: String,
    sample_rate: u32,
) -> Option<Session> {
    use consulta_services::live::registry::RegistryError;

    let peer = Arc::new(Peer::new(
        Role::Patient,
        mime_type,
        sample_rate,
        out_tx.clone(),
        state.settings.live.pending_audio_max_frames,
    ));

    let (room, evicted) = match state.rooms.attach_patient(&room_id, &join_token, peer.clone()) {
        Ok(ok) => ok,
        Err(e) => {
            debug!(%room_id, %e, "patient rejected");
            let code = match e {
                RegistryError::RoomNotFound => close_code::ROOM_NOT_FOUND,
                RegistryError::InvalidToken => close_code::AUTH_FAILURE,
            };
            send_frame(out_tx, &ServerFrame::error(e.to_string()));
            send_close(out_tx, code, "join rejected");
            return None;
        }
    };
    info!(room_id = %room.room_id, "patient connected");

    if evicted.is_some() {
        room.host.send_frame(
            ServerFrame::PatientStatus {
                room_id: room.room_id.clone(),
                connected: false,
                reason: "evicted".to_string(),
            }
            .to_json(),
        );
    }

    let pumps = start_pipeline(state, &room, &peer);

    send_frame(
        out_tx,
        &ServerFrame::Ready {
            role: Role::Patient,
            room_id: room.room_id.clone(),
            join_token: None,
        },
    );
    room.host.send_frame(
        ServerFrame::PatientJoined {
            room_id: room.room_id.clone(),
        }
        .to_json(),
    );

    Some(Session {
        room,
        peer,
        pumps,
        last_alive: Arc::new(Mutex::new(Instant::now())),
    })
}

/// Starts the recognizer session (always) and the transcoder subprocess
/// (only for non-canonical input) for one peer.
fn start_pipeline(
    state: &AppState,
    room: &Arc<Room>,
    peer: &Arc<Peer>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut pumps = Vec::new();

    let (handle, events) = recognizer::spawn(state.settings.recognizer.clone());
    peer.set_recognizer(handle);
    pumps.push(tokio::spawn(pump_recognizer(
        state.clone(),
        room.clone(),
        peer.clone(),
        events,
    )));

    let target_rate = state.settings.recognizer.sample_rate;
    if !transcode::is_canonical(&peer.mime_type, peer.sample_rate, target_rate) {
        match transcode::spawn(&peer.mime_type, peer.sample_rate, target_rate) {
            Ok((handle, events)) => {
                peer.set_transcoder(handle);
                pumps.push(tokio::spawn(pump_transcoder(peer.clone(), events)));
            }
            Err(e) => {
                warn!(%e, "transcoder failed to start");
                peer.send_frame(ServerFrame::error(format!("transcoding error: {}", e)).to_json());
                peer.close(close_code::UPSTREAM_ERROR, "transcoder failed");
            }
        }
    }

    pumps
}

/// Forwards recognizer events into the turn assembler and routes outputs
/// to their audiences: partials to the host, turns to both peers.
async fn pump_recognizer(
    state: AppState,
    room: Arc<Room>,
    peer: Arc<Peer>,
    mut events: tokio::sync::mpsc::Receiver<RecognizerEvent>,
) {
    let assembler = TurnAssembler::new(Duration::from_millis(state.settings.live.min_turn_gap_ms));

    while let Some(event) = events.recv().await {
        match event {
            RecognizerEvent::Open => {
                let Some(handle) = peer.recognizer_handle() else {
                    break;
                };
                // Flips the peer to direct forwarding and flushes the
                // backlog in arrival order.
                for frame in peer.mark_recognizer_ready() {
                    if handle.send_audio(frame).await.is_err() {
                        return;
                    }
                }
                debug!(room_id = %room.room_id, role = peer.role.as_str(), "recognizer ready");
            }
            RecognizerEvent::Hypothesis(hyp) => {
                let output = {
                    let mut turns = peer.turns.lock().unwrap();
                    assembler.assemble(&mut turns, &hyp)
                };
                match output {
                    Some(TurnOutput::Partial { text }) => {
                        room.host.send_frame(
                            ServerFrame::Partial {
                                room_id: room.room_id.clone(),
                                speaker: peer.role,
                                text,
                            }
                            .to_json(),
                        );
                    }
                    Some(TurnOutput::Turn { text }) => {
                        room.broadcast(
                            &ServerFrame::Turn {
                                room_id: room.room_id.clone(),
                                speaker: peer.role,
                                text,
                                ts: Utc::now().timestamp_millis(),
                            }
                            .to_json(),
                        );
                    }
                    None => {}
                }
            }
            RecognizerEvent::Error(message) => {
                warn!(room_id = %room.room_id, role = peer.role.as_str(), %message, "recognizer failed");
                peer.send_frame(ServerFrame::error(message).to_json());
                peer.close(close_code::UPSTREAM_ERROR, "recognizer failed");
                break;
            }
            RecognizerEvent::Closed => break,
        }
    }
}

/// Feeds canonical transcoder output into the peer's recognizer path.
async fn pump_transcoder(
    peer: Arc<Peer>,
    mut events: tokio::sync::mpsc::Receiver<TranscodeEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TranscodeEvent::Frame(bytes) => feed_canonical(&peer, bytes).await,
            TranscodeEvent::Error(message) => {
                warn!(role = peer.role.as_str(), %message, "transcoding failed");
                peer.send_frame(ServerFrame::error(message).to_json());
                peer.close(close_code::UPSTREAM_ERROR, "transcoding failed");
                break;
            }
            TranscodeEvent::Closed => break,
        }
    }
}

/// Forwards one canonical frame, or buffers it while the recognizer opens.
async fn feed_canonical(peer: &Arc<Peer>, frame: Vec<u8>) {
    match peer.route_audio(frame) {
        AudioRoute::Forward(frame) => {
            if let Some(handle) = peer.recognizer_handle() {
                let _ = handle.send_audio(frame).await;
            }
        }
        AudioRoute::Queued { dropped: true } => {
            debug!(role = peer.role.as_str(), "pending audio frame dropped (queue full)");
        }
        AudioRoute::Queued { dropped: false } => {}
    }
}

/// Heartbeat: pings on an interval, reaps the socket after too many
/// silent ticks. Stops automatically when the connection's writer closes.
fn spawn_heartbeat(state: &AppState, session: &Session) -> tokio::task::JoinHandle<()> {
    let interval = Duration::from_millis(state.settings.live.heartbeat_interval_ms);
    let deadline = interval * state.settings.live.heartbeat_max_missed;
    let peer = session.peer.clone();
    let last_alive = session.last_alive.clone();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // immediate first tick
        loop {
            ticker.tick().await;
            let idle = last_alive.lock().unwrap().elapsed();
            if idle > deadline {
                warn!(role = peer.role.as_str(), "heartbeat timeout, reaping socket");
                peer.close(close_code::TIMEOUT, "heartbeat timeout");
                break;
            }
            if !peer.send_frame(
                ServerFrame::Ping {
                    ts: Utc::now().timestamp_millis(),
                }
                .to_json(),
            ) {
                break;
            }
        }
    })
}

/// Post-handshake message loop. Returns the reason the peer left, used
/// for the host-facing `patient_status` notification.
async fn active_loop(
    state: &AppState,
    session: &Session,
    ws_rx: &mut SplitStream<WebSocket>,
) -> &'static str {
    let room = &session.room;
    let peer = &session.peer;

    let mark_alive = || {
        *session.last_alive.lock().unwrap() = Instant::now();
    };

    while let Some(message) = ws_rx.next().await {
        let message = match message {
            Ok(m) => m,
            Err(e) => {
                debug!(%e, "socket error");
                return "closed";
            }
        };

        match message {
            Message::Binary(data) => {
                mark_alive();
                state.rooms.touch(&room.room_id);
                ingest(peer, data.to_vec()).await;
            }
            Message::Text(text) => {
                mark_alive();
                state.rooms.touch(&room.room_id);
                match serde_json::from_str::<ClientFrame>(text.as_str()) {
                    Ok(ClientFrame::Ping { ts }) => {
                        peer.send_frame(
                            ServerFrame::Pong {
                                ts: ts.unwrap_or_else(|| Utc::now().timestamp_millis()),
                            }
                            .to_json(),
                        );
                    }
                    Ok(ClientFrame::Pong { .. }) => {}
                    Ok(ClientFrame::Done) => return "closed",
                    Ok(ClientFrame::Disconnect) => {
                        if peer.role == Role::Patient {
                            return "disconnect";
                        }
                        peer.send_frame(
                            ServerFrame::error("disconnect es solo para pacientes").to_json(),
                        );
                    }
                    Ok(ClientFrame::Hello { .. }) | Ok(ClientFrame::HelloPatient { .. }) => {
                        peer.send_frame(ServerFrame::error("handshake ya completado").to_json());
                    }
                    Err(e) => {
                        debug!(%e, "unknown control frame");
                        peer.send_frame(ServerFrame::error("frame inválido").to_json());
                    }
                }
            }
            Message::Ping(payload) => {
                mark_alive();
                peer.send_pong(payload.to_vec());
            }
            Message::Pong(_) => mark_alive(),
            Message::Close(_) => return "closed",
        }
    }
    "closed"
}

/// Routes one binary audio frame into the peer's ingest pipeline.
async fn ingest(peer: &Arc<Peer>, data: Vec<u8>) {
    if let Some(transcoder) = peer.transcoder_handle() {
        // Transcoder failures surface through its event pump.
        let _ = transcoder.write(data).await;
    } else {
        feed_canonical(peer, data).await;
    }
}

/// Converges every exit path on the registry teardown routine. A host
/// leaving tears down the whole room; a patient leaving frees the slot
/// and tells the host.
fn cleanup(state: &AppState, session: &Session, reason: &str) {
    match session.peer.role {
        Role::Host => {
            state.rooms.teardown(&session.room.room_id);
        }
        Role::Patient => {
            if session
                .room
                .clear_patient(&session.peer.connection_id)
                .is_some()
            {
                session.room.touch();
                session.room.host.send_frame(
                    ServerFrame::PatientStatus {
                        room_id: session.room.room_id.clone(),
                        connected: false,
                        reason: reason.to_string(),
                    }
                    .to_json(),
                );
            }
            session.peer.shutdown(1000, "bye");
        }
    }
    info!(room_id = %session.room.room_id, role = session.peer.role.as_str(), reason, "connection closed");
}
