//! Live dual-channel transcript relay: room lifecycle, per-peer audio
//! pipelines, streaming recognition, and turn assembly. The WebSocket
//! surface lives in the API crate; everything here is socket-agnostic
//! and talks to connections through an [`Outbound`] channel.

pub mod recognizer;
pub mod registry;
pub mod transcode;
pub mod turns;

use tokio::sync::mpsc;

/// A message bound for one peer's WebSocket. The API-side writer task
/// owns the socket sink and drains this channel; closing the channel
/// (or sending `Close`) ends the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Pre-serialized JSON control frame.
    Frame(String),
    /// Protocol-level pong answering a protocol-level ping.
    Pong(Vec<u8>),
    /// Close the socket with the given code and reason.
    Close { code: u16, reason: String },
}

pub type OutboundSender = mpsc::UnboundedSender<Outbound>;
pub type OutboundReceiver = mpsc::UnboundedReceiver<Outbound>;

/// Close codes used across the relay.
pub mod close_code {
    /// Previous patient replaced by a new connection with valid credentials.
    pub const EVICTED: u16 = 4000;
    /// Handshake token rejected.
    pub const AUTH_FAILURE: u16 = 4001;
    /// First frame was not the expected hello, or malformed.
    pub const PROTOCOL_ERROR: u16 = 4002;
    /// Patient hello named a room that does not exist or has expired.
    pub const ROOM_NOT_FOUND: u16 = 4004;
    /// Heartbeat went unanswered.
    pub const TIMEOUT: u16 = 4008;
    /// Peer-scoped upstream or pipeline failure.
    pub const UPSTREAM_ERROR: u16 = 4011;
}
