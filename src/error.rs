//! Error types for the chat relay
//!
//! Defines application-level errors and queue hand-off errors.
//! Uses thiserror for ergonomic error definitions.

use thiserror::Error;

/// Application-level errors
///
/// Transport errors end the affected connection only. Business errors
/// (`NotInRoom`, `EntryDenied`, `MalformedInput`) are values for the
/// caller to act on; none of them is fatal to the room.
#[derive(Debug, Error)]
pub enum AppError {
    /// WebSocket protocol error (fatal for the connection)
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error (fatal for the connection)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection's writer is gone
    #[error("Connection closed")]
    ConnectionClosed,

    /// The room actor has shut down
    #[error("Room closed")]
    RoomClosed,

    /// Operation on a client that already left the room
    #[error("Not in room")]
    NotInRoom,

    /// Name is held by someone else
    #[error("Entry denied for '{0}'")]
    EntryDenied(String),

    /// Hello payload failed parsing or length validation
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Queue hand-off errors
///
/// Occurs when delivering into a client queue that has been closed.
#[derive(Debug, Error)]
pub enum SendError {
    /// The receiving end of the channel has been closed
    #[error("Channel closed")]
    ChannelClosed,
}
