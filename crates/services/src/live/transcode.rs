use std::process::Stdio;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("Failed to spawn ffmpeg: {0}")]
    Spawn(std::io::Error),
    #[error("Transcoder already closed")]
    Closed,
}

/// Canonical output chunks and lifecycle events from one transcoder.
#[derive(Debug)]
pub enum TranscodeEvent {
    /// One chunk of canonical PCM output.
    Frame(Vec<u8>),
    /// ffmpeg failed; the peer's pipeline is unusable.
    Error(String),
    /// ffmpeg exited cleanly after end-of-input.
    Closed,
}

/// Write side of a running transcoder. Cheap to clone; dropping every
/// clone closes ffmpeg's stdin, which flushes and ends the process.
#[derive(Debug, Clone)]
pub struct TranscoderHandle {
    input: mpsc::Sender<Vec<u8>>,
    kill: Arc<Notify>,
}

impl TranscoderHandle {
    pub async fn write(&self, frame: Vec<u8>) -> Result<(), TranscodeError> {
        self.input.send(frame).await.map_err(|_| TranscodeError::Closed)
    }

    /// Hard-kill the subprocess. Idempotent; used by room teardown.
    pub fn kill(&self) {
        self.kill.notify_one();
    }
}

fn base_mime(mime_type: &str) -> &str {
    mime_type.split(';').next().unwrap_or("").trim()
}

/// Mime types that are already canonical PCM and need no subprocess
/// when declared at the target sample rate.
pub fn is_canonical(mime_type: &str, sample_rate: u32, target_rate: u32) -> bool {
    is_raw_pcm(mime_type) && sample_rate == target_rate
}

fn is_raw_pcm(mime_type: &str) -> bool {
    matches!(base_mime(mime_type), "audio/pcm" | "audio/l16" | "audio/raw")
}

/// Maps a declared container mime type to ffmpeg's input format name.
/// `None` lets ffmpeg probe the stream itself.
fn input_format(mime_type: &str) -> Option<&'static str> {
    match base_mime(mime_type) {
        "audio/webm" | "video/webm" => Some("webm"),
        "audio/ogg" | "application/ogg" => Some("ogg"),
        "audio/mpeg" | "audio/mp3" => Some("mp3"),
        "audio/wav" | "audio/x-wav" | "audio/wave" => Some("wav"),
        "audio/flac" => Some("flac"),
        _ => None,
    }
}

/// Input-side ffmpeg arguments for the declared format. Raw PCM is
/// headerless, so ffmpeg cannot probe it from a pipe; it needs the format
/// and the declared rate spelled out (the resample-only case).
fn input_args(mime_type: &str, declared_rate: u32) -> Vec<String> {
    if is_raw_pcm(mime_type) {
        return ["-f", "s16le", "-ac", "1", "-ar"]
            .iter()
            .map(|s| s.to_string())
            .chain([declared_rate.to_string()])
            .collect();
    }
    match input_format(mime_type) {
        Some(fmt) => vec!["-f".to_string(), fmt.to_string()],
        None => vec![],
    }
}

/// Spawns one ffmpeg subprocess converting the peer's declared format
/// (container or raw PCM at `declared_rate`) to mono 16-bit PCM at
/// `target_rate`. Frames written through the handle go to stdin;
/// canonical chunks come back as [`TranscodeEvent::Frame`]s.
pub fn spawn(
    mime_type: &str,
    declared_rate: u32,
    target_rate: u32,
) -> Result<(TranscoderHandle, mpsc::Receiver<TranscodeEvent>), TranscodeError> {
    let mut cmd = Command::new("ffmpeg");
    cmd.args(["-hide_banner", "-loglevel", "error"]);
    cmd.args(input_args(mime_type, declared_rate));
    cmd.args(["-i", "pipe:0"])
        .args(["-f", "s16le", "-acodec", "pcm_s16le", "-ac", "1"])
        .args(["-ar", &target_rate.to_string()])
        .arg("pipe:1")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(TranscodeError::Spawn)?;

    let mut stdin = child.stdin.take();
    let mut stdout = child.stdout.take().expect("ffmpeg stdout is piped");
    let mut stderr = child.stderr.take().expect("ffmpeg stderr is piped");

    let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(64);
    let (event_tx, event_rx) = mpsc::channel::<TranscodeEvent>(64);
    let kill = Arc::new(Notify::new());
    let kill_rx = kill.clone();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        let mut killed = false;
        let mut input_open = true;

        loop {
            tokio::select! {
                frame = input_rx.recv(), if input_open => {
                    match frame {
                        Some(bytes) => {
                            if let Some(sin) = stdin.as_mut() {
                                if let Err(e) = sin.write_all(&bytes).await {
                                    warn!(%e, "ffmpeg stdin write failed");
                                    break;
                                }
                            }
                        }
                        // Input side done: close stdin so ffmpeg flushes and exits.
                        None => {
                            input_open = false;
                            stdin.take();
                        }
                    }
                }
                read = stdout.read(&mut buf) => {
                    match read {
                        Ok(0) => break,
                        Ok(n) => {
                            if event_tx.send(TranscodeEvent::Frame(buf[..n].to_vec())).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(%e, "ffmpeg stdout read failed");
                            break;
                        }
                    }
                }
                _ = kill_rx.notified() => {
                    killed = true;
                    let _ = child.start_kill();
                    break;
                }
            }
        }

        drop(stdin);

        let status = child.wait().await;
        let mut err_out = String::new();
        let _ = stderr.read_to_string(&mut err_out).await;

        match status {
            Ok(s) if s.success() || killed => {
                debug!("ffmpeg exited");
                let _ = event_tx.send(TranscodeEvent::Closed).await;
            }
            Ok(s) => {
                let _ = event_tx
                    .send(TranscodeEvent::Error(format!(
                        "ffmpeg exited with {}: {}",
                        s,
                        err_out.trim()
                    )))
                    .await;
            }
            Err(e) => {
                let _ = event_tx
                    .send(TranscodeEvent::Error(format!("ffmpeg wait failed: {}", e)))
                    .await;
            }
        }
    });

    Ok((
        TranscoderHandle {
            input: input_tx,
            kill,
        },
        event_rx,
    ))
}
