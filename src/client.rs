//! Client handle and dispatch loop
//!
//! A `Client` is the in-room representative of one authenticated
//! connection. Its delivery queue is drained by `dispatch`, which runs
//! as its own task and forwards into the connection's writer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::AppError;
use crate::message::{Message, Outbound, User};
use crate::server::RoomHandle;
use crate::types::ClientId;

/// Room member handle
///
/// Cheap to clone; all clones share the "left" flag, so the connection's
/// read loop and keepalive task can both hold one and `leave` still
/// unregisters exactly once.
#[derive(Debug, Clone)]
pub struct Client {
    id: ClientId,
    user: User,
    room: RoomHandle,
    left: Arc<AtomicBool>,
}

impl Client {
    pub(crate) fn new(id: ClientId, user: User, room: RoomHandle) -> Self {
        Self {
            id,
            user,
            room,
            left: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn has_left(&self) -> bool {
        self.left.load(Ordering::Acquire)
    }

    /// Publish `text` to the room under this client's user
    ///
    /// The sender receives its own message too.
    pub async fn send(&self, text: impl Into<String>) -> Result<(), AppError> {
        if self.has_left() {
            return Err(AppError::NotInRoom);
        }

        self.room
            .broadcast(Message::text(self.user.clone(), text))
            .await?;
        Ok(())
    }

    /// Leave the room
    ///
    /// The first call unregisters the client and frees its name; any
    /// later call fails with `NotInRoom`.
    pub async fn leave(&self) -> Result<(), AppError> {
        if self.left.swap(true, Ordering::AcqRel) {
            return Err(AppError::NotInRoom);
        }

        self.room.leave(self.id).await?;
        Ok(())
    }
}

/// Dispatch loop for one client
///
/// Hands `greeting` to `sink` first, then forwards queued messages until
/// the queue is closed by `Client::leave`. Once the sink is gone
/// (connection writer died) the loop keeps draining and discarding, so
/// broadcasters never wait on a dead connection.
pub(crate) async fn dispatch(
    client_id: ClientId,
    greeting: Vec<Message>,
    mut queue: mpsc::Receiver<Message>,
    sink: mpsc::Sender<Outbound>,
) {
    let mut sink_open = true;

    for msg in greeting {
        if sink.send(msg.into()).await.is_err() {
            sink_open = false;
            break;
        }
    }

    while let Some(msg) = queue.recv().await {
        if !sink_open {
            trace!("Discarding message for {}: sink closed", client_id);
            continue;
        }

        if sink.send(msg.into()).await.is_err() {
            debug!("Sink closed for {}, discarding further messages", client_id);
            sink_open = false;
        }
    }

    debug!("Dispatch loop ended for {}", client_id);
}
