//! Single-Room WebSocket Chat Relay Library
//!
//! A real-time chat relay built with tokio-tungstenite: every connected
//! participant shares one room, and each text message is broadcast to
//! all of them, the sender included.
//!
//! # Features
//! - WebSocket connections on `/connect`
//! - Direct entry by name, or two-step entry with a short-lived login code
//! - Name reservation bound to an email address
//! - Per-connection rate limiting and text truncation
//! - Keepalive pings and idle timeout
//! - Deterministic cleanup on close, error, idle timeout or failed keepalive
//!
//! # Architecture
//! - `RoomServer` is an actor that owns room membership and the name
//!   table; everything goes through its command channel
//! - Each admitted `Client` has a bounded delivery queue drained by its
//!   own dispatch task
//! - Each connection runs a read loop, a writer task and a keepalive task
//!
//! # Example
//! ```ignore
//! use tokio::net::TcpListener;
//! use chat_relay::{handle_connection, ChatState, Config};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::default();
//!     let listener = TcpListener::bind(&config.addr).await.unwrap();
//!     let chat = ChatState::start(config).await.unwrap();
//!
//!     while let Ok((stream, _)) = listener.accept().await {
//!         tokio::spawn(handle_connection(stream, chat.clone()));
//!     }
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod limiter;
pub mod login;
pub mod message;
pub mod room;
pub mod server;
pub mod state;
pub mod types;

// Re-export main types for convenience
pub use client::Client;
pub use config::{AuthMode, Config};
pub use error::{AppError, SendError};
pub use handler::{handle_connection, Session, SessionState};
pub use login::{CodeDelivery, LogDelivery, LoginCodes};
pub use message::{Message, MessageKind, Outbound, User};
pub use room::Room;
pub use server::{RoomCommand, RoomHandle, RoomServer};
pub use state::ChatState;
pub use types::{ClientId, LoginCode};
