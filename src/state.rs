//! Shared per-process chat context
//!
//! Everything a connection handler needs: the room, the login-code
//! registry, the code delivery channel, and the system bot user.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::AppError;
use crate::login::{CodeDelivery, LogDelivery, LoginCodes};
use crate::message::{Outbound, User};
use crate::server::{RoomHandle, RoomServer};

/// Name of the system user that greets newcomers
pub const BOT_NAME: &str = "bot";
pub const BOT_EMAIL: &str = "bot@chat";

#[derive(Clone)]
pub struct ChatState {
    pub config: Arc<Config>,
    pub room: RoomHandle,
    pub logins: LoginCodes,
    pub delivery: Arc<dyn CodeDelivery>,
    pub bot: User,
}

impl ChatState {
    /// Start the room and enter the bot, delivering login codes to the log
    pub async fn start(config: Config) -> Result<Self, AppError> {
        Self::start_with_delivery(config, Arc::new(LogDelivery)).await
    }

    pub async fn start_with_delivery(
        config: Config,
        delivery: Arc<dyn CodeDelivery>,
    ) -> Result<Self, AppError> {
        config.validate()?;

        let room = RoomServer::spawn(config.queue_capacity);
        let bot = User::new(BOT_NAME, BOT_EMAIL);

        // The bot stays in the room for the life of the process and
        // records what it hears.
        let (record_tx, record_rx) = mpsc::channel(config.queue_capacity);
        room.enter(bot.clone(), record_tx).await?;
        tokio::spawn(record_chat(record_rx));
        info!("@{} entered room", bot.name);

        Ok(Self {
            logins: LoginCodes::new(config.login_code_ttl),
            config: Arc::new(config),
            room,
            delivery,
            bot,
        })
    }
}

/// Log every room message under the `chat` target
async fn record_chat(mut frames: mpsc::Receiver<Outbound>) {
    while let Some(frame) = frames.recv().await {
        if let Outbound::Message(msg) = frame {
            debug!(target: "chat", "@{}: {}", msg.user.name, msg.text);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bot_holds_its_name() {
        let state = ChatState::start(Config::default()).await.unwrap();

        assert_eq!(state.room.member_count().await.unwrap(), 1);
        assert!(!state
            .room
            .can_enter(&User::new("BOT", "me@x.com"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_invalid_config_refused() {
        let config = Config {
            queue_capacity: 0,
            ..Config::default()
        };
        assert!(matches!(
            ChatState::start(config).await,
            Err(AppError::Config(_))
        ));
    }
}
