//! Chat Relay - Entry Point
//!
//! Starts the room and the TCP listener, accepting connections.

use std::env;

use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use chat_relay::{handle_connection, AppError, ChatState, Config};

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=chat_relay=trace,chat=debug
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("chat_relay=info")),
        )
        .init();

    let mut config = Config::from_env()?;

    // Bind address from command line overrides the environment
    if let Some(addr) = env::args().nth(1) {
        config.addr = addr;
    }

    if config.accepts_any_origin() {
        warn!("CHAT_ALLOWED_ORIGINS is unset: accepting WebSocket handshakes from any origin");
    }

    // Start TCP listener
    let listener = TcpListener::bind(&config.addr).await?;
    info!(
        "Chat relay listening on {} ({:?} entry)",
        config.addr, config.auth_mode
    );

    // Start the room actor and seat the bot
    let chat = ChatState::start(config).await?;

    info!("RoomServer actor started");

    // Connection accept loop
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("New connection from {}", addr);
                let chat = chat.clone();

                // Spawn handler task for each connection
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, chat).await {
                        error!("Connection handler error: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}
