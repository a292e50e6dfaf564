use consulta_config::RecognizerSettings;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tracing::{debug, warn};

use super::turns::Hypothesis;

#[derive(Debug, Error)]
pub enum RecognizerError {
    #[error("Recognizer session already closed")]
    Closed,
}

/// Lifecycle and hypothesis events from one recognizer session.
#[derive(Debug)]
pub enum RecognizerEvent {
    /// Upstream handshake completed; pending audio may be flushed.
    Open,
    Hypothesis(Hypothesis),
    /// Session failed (handshake rejection or transport error).
    Error(String),
    /// Session ended cleanly.
    Closed,
}

/// Write side of a recognizer session. Cheap to clone; dropping every
/// clone sends a Close to the upstream service and ends the session task.
#[derive(Debug, Clone)]
pub struct RecognizerHandle {
    audio: mpsc::Sender<Vec<u8>>,
}

impl RecognizerHandle {
    pub async fn send_audio(&self, frame: Vec<u8>) -> Result<(), RecognizerError> {
        self.audio.send(frame).await.map_err(|_| RecognizerError::Closed)
    }
}

/// One message from the streaming recognizer. Unknown fields are ignored
/// so provider-side additions don't break the session.
#[derive(Debug, Deserialize)]
struct UpstreamMessage {
    #[serde(default)]
    transcript: String,
    #[serde(default)]
    is_final: bool,
    #[serde(default)]
    speech_final: bool,
}

/// Builds the session URL: canonical PCM encoding plus the configured
/// model, language, and endpointing sensitivity.
fn session_url(settings: &RecognizerSettings) -> String {
    let sep = if settings.url.contains('?') { '&' } else { '?' };
    format!(
        "{}{}model={}&language={}&encoding=linear16&channels=1&sample_rate={}&interim_results=true&endpointing={}",
        settings.url, sep, settings.model, settings.language, settings.sample_rate, settings.endpointing_ms,
    )
}

/// Opens one streaming-recognition session and spawns its I/O task.
///
/// The task emits [`RecognizerEvent::Open`] once the upstream handshake
/// completes; audio written through the handle before that is the caller's
/// responsibility to buffer (see the peer's pending queue in the registry).
pub fn spawn(settings: RecognizerSettings) -> (RecognizerHandle, mpsc::Receiver<RecognizerEvent>) {
    let (audio_tx, mut audio_rx) = mpsc::channel::<Vec<u8>>(512);
    let (event_tx, event_rx) = mpsc::channel::<RecognizerEvent>(64);

    tokio::spawn(async move {
        let url = session_url(&settings);

        let mut request = match url.clone().into_client_request() {
            Ok(r) => r,
            Err(e) => {
                let _ = event_tx
                    .send(RecognizerEvent::Error(format!("invalid recognizer url: {}", e)))
                    .await;
                return;
            }
        };
        if let Some(key) = &settings.api_key {
            match format!("Token {}", key).parse() {
                Ok(value) => {
                    request.headers_mut().insert("Authorization", value);
                }
                Err(e) => {
                    let _ = event_tx
                        .send(RecognizerEvent::Error(format!("invalid api key: {}", e)))
                        .await;
                    return;
                }
            }
        }

        let (mut upstream, _) = match connect_async(request).await {
            Ok(ok) => ok,
            Err(e) => {
                warn!(%e, "recognizer handshake failed");
                let _ = event_tx
                    .send(RecognizerEvent::Error(format!("recognizer handshake failed: {}", e)))
                    .await;
                return;
            }
        };

        debug!(url = %settings.url, "recognizer session open");
        if event_tx.send(RecognizerEvent::Open).await.is_err() {
            let _ = upstream.send(Message::Close(None)).await;
            return;
        }

        loop {
            tokio::select! {
                frame = audio_rx.recv() => {
                    match frame {
                        Some(bytes) => {
                            if let Err(e) = upstream.send(Message::binary(bytes)).await {
                                let _ = event_tx
                                    .send(RecognizerEvent::Error(format!("recognizer send failed: {}", e)))
                                    .await;
                                break;
                            }
                        }
                        // Owning peer is gone: close the session, best-effort.
                        None => {
                            let _ = upstream.send(Message::Close(None)).await;
                            break;
                        }
                    }
                }
                incoming = upstream.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<UpstreamMessage>(text.as_str()) {
                                Ok(msg) => {
                                    let _ = event_tx
                                        .send(RecognizerEvent::Hypothesis(Hypothesis {
                                            transcript: msg.transcript,
                                            is_final: msg.is_final,
                                            speech_final: msg.speech_final,
                                        }))
                                        .await;
                                }
                                Err(e) => {
                                    debug!(%e, "unparseable recognizer message ignored");
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            let _ = event_tx.send(RecognizerEvent::Closed).await;
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            let _ = event_tx
                                .send(RecognizerEvent::Error(format!("recognizer transport error: {}", e)))
                                .await;
                            break;
                        }
                    }
                }
            }
        }
    });

    (RecognizerHandle { audio: audio_tx }, event_rx)
}
