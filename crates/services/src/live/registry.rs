use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::recognizer::RecognizerHandle;
use super::transcode::TranscoderHandle;
use super::turns::TurnState;
use super::{Outbound, OutboundSender, close_code};

/// Error messages are user-facing wire strings (the clients are Spanish).
#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("Room no existe o expiró")]
    RoomNotFound,
    #[error("joinToken inválido")]
    InvalidToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Patient,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Host => "host",
            Role::Patient => "patient",
        }
    }
}

/// Where [`Peer::route_audio`] put a canonical frame.
#[derive(Debug, PartialEq)]
pub enum AudioRoute {
    /// Recognizer session is open; send the frame directly.
    Forward(Vec<u8>),
    /// Buffered until the session opens. `dropped` is true when the
    /// oldest buffered frame was discarded to stay under the cap.
    Queued { dropped: bool },
}

/// One socket's live pipeline state. Owned by its Room; never outlives it.
#[derive(Debug)]
pub struct Peer {
    /// UUID per WebSocket connection, used to tell a stale patient socket
    /// from its replacement during eviction races.
    pub connection_id: String,
    pub role: Role,
    pub mime_type: String,
    pub sample_rate: u32,
    outbound: OutboundSender,
    /// False until the recognizer session reports open. Only flipped
    /// under the `pending_audio` lock.
    recognizer_ready: AtomicBool,
    /// Canonical frames that arrived before the recognizer was ready.
    pending_audio: Mutex<VecDeque<Vec<u8>>>,
    pending_cap: usize,
    recognizer: Mutex<Option<RecognizerHandle>>,
    transcoder: Mutex<Option<TranscoderHandle>>,
    pub turns: Mutex<TurnState>,
}

impl Peer {
    pub fn new(
        role: Role,
        mime_type: String,
        sample_rate: u32,
        outbound: OutboundSender,
        pending_cap: usize,
    ) -> Self {
        Self {
            connection_id: uuid::Uuid::new_v4().to_string(),
            role,
            mime_type,
            sample_rate,
            outbound,
            recognizer_ready: AtomicBool::new(false),
            pending_audio: Mutex::new(VecDeque::new()),
            pending_cap,
            recognizer: Mutex::new(None),
            transcoder: Mutex::new(None),
            turns: Mutex::new(TurnState::default()),
        }
    }

    /// Sends a pre-serialized control frame. Returns false when the
    /// connection's writer is already gone (teardown treats that as a no-op).
    pub fn send_frame(&self, json: String) -> bool {
        self.outbound.send(Outbound::Frame(json)).is_ok()
    }

    pub fn send_pong(&self, payload: Vec<u8>) {
        let _ = self.outbound.send(Outbound::Pong(payload));
    }

    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.outbound.send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
    }

    pub fn set_recognizer(&self, handle: RecognizerHandle) {
        *self.recognizer.lock().unwrap() = Some(handle);
    }

    pub fn recognizer_handle(&self) -> Option<RecognizerHandle> {
        self.recognizer.lock().unwrap().clone()
    }

    pub fn set_transcoder(&self, handle: TranscoderHandle) {
        *self.transcoder.lock().unwrap() = Some(handle);
    }

    pub fn transcoder_handle(&self) -> Option<TranscoderHandle> {
        self.transcoder.lock().unwrap().clone()
    }

    /// Routes one canonical frame: hands it back for direct forwarding
    /// once the recognizer is open, buffers it otherwise. The queue is
    /// bounded; drop-oldest keeps memory flat under a slow upstream
    /// connect. The readiness check happens under the queue lock, so a
    /// frame can never slip behind [`mark_recognizer_ready`]'s drain and
    /// strand in the buffer.
    ///
    /// [`mark_recognizer_ready`]: Self::mark_recognizer_ready
    pub fn route_audio(&self, frame: Vec<u8>) -> AudioRoute {
        let mut queue = self.pending_audio.lock().unwrap();
        if self.recognizer_ready.load(Ordering::SeqCst) {
            return AudioRoute::Forward(frame);
        }
        let mut dropped = false;
        if queue.len() >= self.pending_cap {
            queue.pop_front();
            dropped = true;
        }
        queue.push_back(frame);
        AudioRoute::Queued { dropped }
    }

    /// Flips the peer to direct forwarding and returns everything that
    /// was buffered, in arrival order.
    pub fn mark_recognizer_ready(&self) -> Vec<Vec<u8>> {
        let mut queue = self.pending_audio.lock().unwrap();
        self.recognizer_ready.store(true, Ordering::SeqCst);
        queue.drain(..).collect()
    }

    /// Closes the socket and releases pipeline resources. Idempotent:
    /// handles are taken once, later calls find nothing to release.
    pub fn shutdown(&self, code: u16, reason: &str) {
        self.close(code, reason);
        if let Some(transcoder) = self.transcoder.lock().unwrap().take() {
            transcoder.kill();
        }
        // Dropping the last handle closes the upstream session.
        self.recognizer.lock().unwrap().take();
    }
}

/// One live session: a host, at most one patient, and an activity clock.
#[derive(Debug)]
pub struct Room {
    pub room_id: String,
    /// Single-room-scoped secret, disclosed only to the host.
    pub join_token: String,
    pub created_at: DateTime<Utc>,
    last_seen: Mutex<Instant>,
    pub host: Arc<Peer>,
    patient: Mutex<Option<Arc<Peer>>>,
}

impl Room {
    fn new(host: Arc<Peer>) -> Self {
        Self {
            room_id: nanoid::nanoid!(),
            join_token: nanoid::nanoid!(),
            created_at: Utc::now(),
            last_seen: Mutex::new(Instant::now()),
            host,
            patient: Mutex::new(None),
        }
    }

    pub fn touch(&self) {
        *self.last_seen.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_seen.lock().unwrap().elapsed()
    }

    pub fn patient(&self) -> Option<Arc<Peer>> {
        self.patient.lock().unwrap().clone()
    }

    pub fn has_patient(&self) -> bool {
        self.patient.lock().unwrap().is_some()
    }

    /// Installs a new patient, returning the evicted previous one (if any).
    /// The slot swap is atomic under the lock, so two patient sockets never
    /// coexist in the slot.
    pub fn set_patient(&self, peer: Arc<Peer>) -> Option<Arc<Peer>> {
        self.patient.lock().unwrap().replace(peer)
    }

    /// Clears the patient slot only when it still holds the given
    /// connection. A stale socket closing after its eviction must not
    /// remove its replacement.
    pub fn clear_patient(&self, connection_id: &str) -> Option<Arc<Peer>> {
        let mut slot = self.patient.lock().unwrap();
        match slot.as_ref() {
            Some(current) if current.connection_id == connection_id => slot.take(),
            _ => None,
        }
    }

    /// Sends a control frame to both peers (patient slot may be empty).
    pub fn broadcast(&self, json: &str) {
        self.host.send_frame(json.to_string());
        if let Some(patient) = self.patient() {
            patient.send_frame(json.to_string());
        }
    }
}

/// In-memory room registry — the only cross-connection shared structure.
/// All mutation goes through here so teardown has a single code path.
pub struct RoomRegistry {
    rooms: DashMap<String, Arc<Room>>,
    ttl: Duration,
}

impl RoomRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            rooms: DashMap::new(),
            ttl,
        }
    }

    /// Creates a room for an authenticated host. Room id and join token are
    /// independent unguessable tokens; knowing one reveals nothing about
    /// the other.
    pub fn create_room(&self, host: Arc<Peer>) -> Arc<Room> {
        let room = Arc::new(Room::new(host));
        self.rooms.insert(room.room_id.clone(), room.clone());
        info!(room_id = %room.room_id, "room created");
        room
    }

    pub fn get(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.get(room_id).map(|r| r.clone())
    }

    /// Validates credentials and installs the patient, evicting a previous
    /// patient connection. A failed attempt leaves the room untouched.
    pub fn attach_patient(
        &self,
        room_id: &str,
        join_token: &str,
        patient: Arc<Peer>,
    ) -> Result<(Arc<Room>, Option<Arc<Peer>>), RegistryError> {
        let room = self.get(room_id).ok_or(RegistryError::RoomNotFound)?;
        if room.join_token != join_token {
            return Err(RegistryError::InvalidToken);
        }

        let evicted = room.set_patient(patient);
        if let Some(previous) = &evicted {
            warn!(room_id, previous = %previous.connection_id, "patient evicted by reconnection");
            previous.shutdown(close_code::EVICTED, "replaced by a new connection");
        }
        room.touch();
        Ok((room, evicted))
    }

    pub fn touch(&self, room_id: &str) {
        if let Some(room) = self.get(room_id) {
            room.touch();
        }
    }

    /// Removes a room and shuts down both peers. Idempotent: tearing down
    /// an already-removed room is a no-op returning false.
    pub fn teardown(&self, room_id: &str) -> bool {
        let Some((_, room)) = self.rooms.remove(room_id) else {
            return false;
        };
        room.host.shutdown(1000, "room closed");
        if let Some(patient) = room.patient.lock().unwrap().take() {
            patient.shutdown(1000, "room closed");
        }
        info!(room_id, "room removed");
        true
    }

    /// Tears down every room idle beyond the TTL. Ids are collected first
    /// so removal never runs under the map iterator.
    pub fn sweep(&self) -> usize {
        let expired: Vec<String> = self
            .rooms
            .iter()
            .filter(|entry| entry.value().idle_for() > self.ttl)
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for room_id in expired {
            debug!(%room_id, "room expired");
            if self.teardown(&room_id) {
                removed += 1;
            }
        }
        removed
    }

    /// Background GC ticker, decoupled from any connection's lifetime.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let removed = registry.sweep();
                if removed > 0 {
                    info!(removed, "GC sweep removed idle rooms");
                }
            }
        })
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn connection_count(&self) -> usize {
        self.rooms
            .iter()
            .map(|entry| 1 + entry.value().has_patient() as usize)
            .sum()
    }
}
