//! WebSocket connection handler
//!
//! Drives one connection through hello → (auth) → authenticated.
//! `Session` is the protocol state machine and knows nothing about
//! sockets; `handle_connection` wires it to a WebSocket with a writer
//! task, a keepalive task and an idle-timed read loop.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, trace, warn};

use crate::client::Client;
use crate::config::{AuthMode, Config};
use crate::error::AppError;
use crate::limiter::TokenBucket;
use crate::message::{Message, MessageKind, Outbound, User};
use crate::state::ChatState;
use crate::types::ClientId;

/// Only this path is upgraded to a chat connection
pub const CONNECT_PATH: &str = "/connect";

/// Channel buffer size for frames waiting on the writer
const OUTBOUND_BUFFER_SIZE: usize = 64;

/// Protocol state of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingHello,
    /// Login code issued, waiting for it to come back
    AwaitingAuth,
    Authenticated,
}

/// Per-connection protocol state machine
///
/// Replies and room traffic are pushed to `outbound`; the only error
/// `handle` returns is a transport-side one (writer gone, room gone),
/// after which the connection should be torn down.
pub struct Session {
    state: SessionState,
    chat: ChatState,
    limiter: TokenBucket,
    outbound: mpsc::Sender<Outbound>,
    client: Arc<OnceLock<Client>>,
}

impl Session {
    pub fn new(chat: ChatState, outbound: mpsc::Sender<Outbound>) -> Self {
        let limiter = TokenBucket::new(chat.config.rate_limit_burst, chat.config.rate_limit_per_sec);
        Self {
            state: SessionState::AwaitingHello,
            chat,
            limiter,
            outbound,
            client: Arc::new(OnceLock::new()),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn client(&self) -> Option<&Client> {
        self.client.get()
    }

    /// Slot the keepalive task watches for the admitted client
    pub fn client_slot(&self) -> Arc<OnceLock<Client>> {
        Arc::clone(&self.client)
    }

    /// Process one inbound message
    ///
    /// Kinds that are not valid in the current state are ignored.
    pub async fn handle(&mut self, msg: Message) -> Result<(), AppError> {
        match (self.state, msg.kind) {
            (SessionState::AwaitingHello, MessageKind::Hello) => self.on_hello(&msg.text).await,
            (SessionState::AwaitingAuth, MessageKind::Auth) => self.on_auth(&msg.text).await,
            (SessionState::Authenticated, MessageKind::Text) => self.on_text(msg.text).await,
            (state, kind) => {
                debug!("Ignoring {:?} message in state {:?}", kind, state);
                Ok(())
            }
        }
    }

    /// Best-effort farewell, then leave the room
    ///
    /// Safe to call more than once and after the keepalive already left.
    pub async fn teardown(&mut self) {
        let Some(client) = self.client.get() else {
            return;
        };

        if let Err(e) = client.send("left chat").await {
            debug!("Farewell from @{} not sent: {}", client.user().name, e);
        }

        match client.leave().await {
            Ok(()) => info!("@{} left chat", client.user().name),
            Err(AppError::NotInRoom) => debug!("@{} already left", client.user().name),
            Err(e) => warn!("Failed to remove @{}: {}", client.user().name, e),
        }
    }

    async fn reply(&self, msg: Message) -> Result<(), AppError> {
        self.outbound
            .send(msg.into())
            .await
            .map_err(|_| AppError::ConnectionClosed)
    }

    async fn on_hello(&mut self, text: &str) -> Result<(), AppError> {
        let config = Arc::clone(&self.chat.config);
        let require_email = config.auth_mode == AuthMode::LoginCode;

        let user = match parse_hello(text, config.max_field_len, require_email) {
            Ok(user) => user,
            Err(e) => {
                debug!("Ignoring hello: {}", e);
                return Ok(());
            }
        };

        if !self.chat.room.can_enter(&user).await? {
            info!("@{} may not enter: name is taken", user.name);
            return self
                .reply(Message::control(MessageKind::EntryRejected, user))
                .await;
        }

        match config.auth_mode {
            AuthMode::Direct => self.admit(user).await,
            AuthMode::LoginCode => {
                let code = self.chat.logins.issue(user.clone());
                self.chat.delivery.deliver(&user, &code);
                self.state = SessionState::AwaitingAuth;
                Ok(())
            }
        }
    }

    async fn on_auth(&mut self, token: &str) -> Result<(), AppError> {
        match self.chat.logins.consume(token) {
            Some(user) => self.admit(user).await,
            None => {
                info!("Login code rejected");
                self.reply(Message::control(MessageKind::AuthReject, User::default()))
                    .await
            }
        }
    }

    /// Enter the room, acknowledge and greet
    ///
    /// The ack and the bot's greetings go to the newcomer only, ahead of
    /// any room traffic.
    async fn admit(&mut self, user: User) -> Result<(), AppError> {
        debug_assert!(
            self.client.get().is_none(),
            "session admitted a second client"
        );

        let mut greeting = vec![Message::control(MessageKind::AuthAck, user.clone())];
        greeting.extend(
            welcome_messages(&user)
                .into_iter()
                .map(|text| Message::text(self.chat.bot.clone(), text)),
        );

        let client = match self
            .chat
            .room
            .enter_with_greeting(user.clone(), self.outbound.clone(), greeting)
            .await
        {
            Ok(client) => client,
            Err(AppError::EntryDenied(name)) => {
                info!("@{} lost the name before entering", name);
                self.state = SessionState::AwaitingHello;
                return self
                    .reply(Message::control(MessageKind::EntryRejected, user))
                    .await;
            }
            Err(e) => return Err(e),
        };

        if let Err(extra) = self.client.set(client.clone()) {
            warn!("Connection already has a client, dropping @{}", user.name);
            if let Err(e) = extra.leave().await {
                warn!("Failed to remove duplicate @{}: {}", user.name, e);
            }
            return Ok(());
        }
        self.state = SessionState::Authenticated;

        if user.has_email() {
            info!("@{} entered with email {}", user.name, user.email);
        } else {
            info!("@{} entered", user.name);
        }

        if let Err(e) = client.send("entered chat").await {
            debug!("Entry announcement for @{} not sent: {}", user.name, e);
        }
        Ok(())
    }

    async fn on_text(&mut self, mut text: String) -> Result<(), AppError> {
        let Some(client) = self.client.get() else {
            return Ok(());
        };

        if !self.limiter.allow() {
            trace!("Rate limited, dropping message from @{}", client.user().name);
            return Ok(());
        }

        truncate_chars(&mut text, self.chat.config.max_text_len);

        match client.send(text).await {
            Ok(()) | Err(AppError::NotInRoom) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Parse a hello payload: `name` or `name\nemail`
pub fn parse_hello(text: &str, max_len: usize, require_email: bool) -> Result<User, AppError> {
    let parts: Vec<&str> = text.split('\n').map(str::trim).collect();

    let (name, email) = match parts.as_slice() {
        [name] if !require_email => (*name, ""),
        [name, email] => (*name, *email),
        _ => {
            return Err(AppError::MalformedInput(
                "expected a name and an email line".to_string(),
            ))
        }
    };

    if name.is_empty() {
        return Err(AppError::MalformedInput("empty name".to_string()));
    }
    if require_email && email.is_empty() {
        return Err(AppError::MalformedInput("empty email".to_string()));
    }
    if name.chars().count() > max_len || email.chars().count() > max_len {
        return Err(AppError::MalformedInput(format!(
            "name and email are limited to {} characters",
            max_len
        )));
    }

    Ok(User::new(name, email))
}

/// Cut `text` down to at most `max` characters
pub fn truncate_chars(text: &mut String, max: usize) {
    if let Some((idx, _)) = text.char_indices().nth(max) {
        text.truncate(idx);
    }
}

fn welcome_messages(user: &User) -> [String; 2] {
    let reminder = if user.has_email() {
        format!(
            "Please be kind in the chat, and remember that your email ({}) is tied to what you say here. Happy chatting!",
            user.email
        )
    } else {
        "Please be kind in the chat. Happy chatting!".to_string()
    };

    [format!("Hi @{}! Welcome to the chat.", user.name), reminder]
}

/// Handle a new TCP connection
///
/// Performs the WebSocket handshake on `/connect`, then runs the
/// session until the peer closes, errors, or goes idle.
pub async fn handle_connection(stream: TcpStream, chat: ChatState) -> Result<(), AppError> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    debug!("New TCP connection from {}", peer_addr);

    let config = Arc::clone(&chat.config);
    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        check_handshake(&config, req, resp)
    })
    .await?;
    let (ws_sender, mut ws_receiver) = ws_stream.split();

    let connection_id = ClientId::new();
    info!("Connection {} established from {}", connection_id, peer_addr);

    let (out_tx, out_rx) = mpsc::channel::<Outbound>(OUTBOUND_BUFFER_SIZE);
    tokio::spawn(write_frames(connection_id, ws_sender, out_rx, config.idle_timeout));

    let mut session = Session::new(chat, out_tx.clone());
    let keepalive_task = tokio::spawn(keepalive(
        out_tx,
        session.client_slot(),
        config.keepalive_interval,
    ));

    loop {
        let frame = match timeout(config.idle_timeout, ws_receiver.next()).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("Connection {} stream ended", connection_id);
                break;
            }
            Err(_) => {
                info!("Connection {} idle for {:?}, closing", connection_id, config.idle_timeout);
                break;
            }
        };

        match frame {
            Ok(WsMessage::Text(text)) => match Message::from_json(&text) {
                Ok(msg) => {
                    if let Err(e) = session.handle(msg).await {
                        debug!("Connection {} can no longer be served: {}", connection_id, e);
                        break;
                    }
                }
                Err(e) => {
                    warn!("Invalid message from {}: {}", connection_id, e);
                }
            },
            Ok(WsMessage::Close(_)) => {
                debug!("Connection {} sent close frame", connection_id);
                break;
            }
            Ok(WsMessage::Ping(_)) => {
                // Pong is handled automatically by tungstenite
                debug!("Ping from {}", connection_id);
            }
            Ok(WsMessage::Pong(_)) => {
                trace!("Pong from {}", connection_id);
            }
            Ok(_) => {
                // Binary or raw frames - ignore
            }
            Err(e) => {
                warn!("WebSocket error for {}: {}", connection_id, e);
                break;
            }
        }
    }

    session.teardown().await;
    keepalive_task.abort();

    info!("Connection {} closed", connection_id);

    Ok(())
}

/// Handshake filter: right path, acceptable origin
fn check_handshake(config: &Config, req: &Request, resp: Response) -> Result<Response, ErrorResponse> {
    if req.uri().path() != CONNECT_PATH {
        return Err(reject(StatusCode::NOT_FOUND, "not found"));
    }

    let origin = req
        .headers()
        .get("origin")
        .and_then(|value| value.to_str().ok());
    if !config.origin_allowed(origin) {
        warn!("Refusing connection from origin {:?}", origin);
        return Err(reject(StatusCode::FORBIDDEN, "origin not allowed"));
    }

    Ok(resp)
}

fn reject(status: StatusCode, body: &str) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(body.to_string()));
    *resp.status_mut() = status;
    resp
}

/// Writer task: sole owner of the socket's sending half
async fn write_frames(
    connection_id: ClientId,
    mut ws_sender: SplitSink<WebSocketStream<TcpStream>, WsMessage>,
    mut frames: mpsc::Receiver<Outbound>,
    write_timeout: Duration,
) {
    while let Some(frame) = frames.recv().await {
        let ws_msg = match frame {
            Outbound::Message(msg) => match msg.to_json() {
                Ok(json) => WsMessage::Text(json.into()),
                Err(e) => {
                    error!("Failed to serialize message: {}", e);
                    continue;
                }
            },
            Outbound::Ping => WsMessage::Ping(Default::default()),
        };

        match timeout(write_timeout, ws_sender.send(ws_msg)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("WebSocket send failed for {}: {}", connection_id, e);
                break;
            }
            Err(_) => {
                warn!("WebSocket send timed out for {}", connection_id);
                break;
            }
        }
    }

    // Fail pending and future pushes right away.
    drop(frames);
    debug!("Write task ended for {}", connection_id);

    let _ = timeout(write_timeout, ws_sender.close()).await;
}

/// Keepalive task
///
/// Queues a ping every `period`. Once the writer is gone, leaves the
/// room on the connection's behalf (if it had entered) and stops.
async fn keepalive(outbound: mpsc::Sender<Outbound>, client: Arc<OnceLock<Client>>, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);

    loop {
        ticker.tick().await;

        if outbound.send(Outbound::Ping).await.is_err() {
            debug!("Keepalive ping failed");
            if let Some(client) = client.get() {
                if client.leave().await.is_ok() {
                    info!("@{} dropped after failed keepalive", client.user().name);
                }
            }
            return;
        }
    }
}
