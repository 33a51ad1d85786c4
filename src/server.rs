//! RoomServer actor implementation
//!
//! The central actor that owns the `Room` (membership and name table).
//! Connection handlers talk to it through a cloneable `RoomHandle`; every
//! admission decision and table mutation is one command processed in
//! order, so two connections can never both win the same name.

use futures_util::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace};

use crate::client::{self, Client};
use crate::error::{AppError, SendError};
use crate::message::{Message, Outbound, User};
use crate::room::Room;
use crate::types::ClientId;

/// Channel buffer size for room commands
const CHANNEL_BUFFER_SIZE: usize = 256;

/// Commands sent from handles to the RoomServer actor
#[derive(Debug)]
pub enum RoomCommand {
    /// Ask whether a user may enter
    CanEnter {
        user: User,
        reply: oneshot::Sender<bool>,
    },
    /// Register a client with the sending half of its queue
    Enter {
        client_id: ClientId,
        user: User,
        queue: mpsc::Sender<Message>,
        reply: oneshot::Sender<Result<(), AppError>>,
    },
    /// Unregister a client
    Leave {
        client_id: ClientId,
        reply: oneshot::Sender<bool>,
    },
    /// Snapshot every member's queue for a broadcast
    Recipients {
        reply: oneshot::Sender<Vec<(ClientId, mpsc::Sender<Message>)>>,
    },
    /// Current number of members
    MemberCount { reply: oneshot::Sender<usize> },
}

/// The room actor
///
/// Never awaits on a client queue: broadcasts take a snapshot here and
/// deliver from the caller's task, so a stalled recipient cannot stall
/// admission or departures.
pub struct RoomServer {
    room: Room,
    receiver: mpsc::Receiver<RoomCommand>,
}

impl RoomServer {
    /// Create a new RoomServer with the given command receiver
    pub fn new(receiver: mpsc::Receiver<RoomCommand>) -> Self {
        Self {
            room: Room::new(),
            receiver,
        }
    }

    /// Start the actor on the current runtime and return a handle to it
    ///
    /// `queue_capacity` bounds each client's delivery queue.
    pub fn spawn(queue_capacity: usize) -> RoomHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        tokio::spawn(RoomServer::new(cmd_rx).run());
        RoomHandle::new(cmd_tx, queue_capacity)
    }

    /// Run the RoomServer event loop
    ///
    /// Continuously receives and processes commands until all handles are dropped.
    pub async fn run(mut self) {
        info!("RoomServer started");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!("RoomServer shutting down");
    }

    /// Process a single command
    fn handle_command(&mut self, cmd: RoomCommand) {
        match cmd {
            RoomCommand::CanEnter { user, reply } => {
                let _ = reply.send(self.room.can_enter(&user));
            }
            RoomCommand::Enter {
                client_id,
                user,
                queue,
                reply,
            } => {
                let name = user.name.clone();
                let result = self.room.enter(client_id, user, queue);
                match &result {
                    Ok(()) => info!("Client {} entered room as @{}", client_id, name),
                    Err(e) => debug!("Client {} refused: {}", client_id, e),
                }
                debug!("Total members: {}", self.room.member_count());
                let _ = reply.send(result);
            }
            RoomCommand::Leave { client_id, reply } => {
                let departed = self.room.leave(client_id);
                if let Some(user) = &departed {
                    info!("Client {} (@{}) left room", client_id, user.name);
                    debug!("Total members: {}", self.room.member_count());
                }
                let _ = reply.send(departed.is_some());
            }
            RoomCommand::Recipients { reply } => {
                let _ = reply.send(self.room.recipients());
            }
            RoomCommand::MemberCount { reply } => {
                let _ = reply.send(self.room.member_count());
            }
        }
    }
}

/// Cloneable handle to the room actor
#[derive(Debug, Clone)]
pub struct RoomHandle {
    commands: mpsc::Sender<RoomCommand>,
    queue_capacity: usize,
}

impl RoomHandle {
    pub fn new(commands: mpsc::Sender<RoomCommand>, queue_capacity: usize) -> Self {
        Self {
            commands,
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Send a command and wait for the actor's reply
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> RoomCommand,
    ) -> Result<T, AppError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(make(reply_tx))
            .await
            .map_err(|_| AppError::RoomClosed)?;
        reply_rx.await.map_err(|_| AppError::RoomClosed)
    }

    /// Check whether `user` may enter (no side effects)
    pub async fn can_enter(&self, user: &User) -> Result<bool, AppError> {
        let user = user.clone();
        self.request(|reply| RoomCommand::CanEnter { user, reply })
            .await
    }

    /// Register `user` and start its dispatch loop
    ///
    /// Every message broadcast to the new client is forwarded to `sink`.
    /// Fails with `EntryDenied` if the name was taken since the caller's
    /// `can_enter` check.
    pub async fn enter(&self, user: User, sink: mpsc::Sender<Outbound>) -> Result<Client, AppError> {
        self.enter_with_greeting(user, sink, Vec::new()).await
    }

    /// Like `enter`, but `greeting` reaches `sink` ahead of any room traffic
    pub async fn enter_with_greeting(
        &self,
        user: User,
        sink: mpsc::Sender<Outbound>,
        greeting: Vec<Message>,
    ) -> Result<Client, AppError> {
        let client_id = ClientId::new();
        let (queue_tx, queue_rx) = mpsc::channel(self.queue_capacity);

        let registered = user.clone();
        self.request(|reply| RoomCommand::Enter {
            client_id,
            user: registered,
            queue: queue_tx,
            reply,
        })
        .await??;

        tokio::spawn(client::dispatch(client_id, greeting, queue_rx, sink));

        Ok(Client::new(client_id, user, self.clone()))
    }

    /// Deliver `msg` to every current member, the sender included
    ///
    /// Hand-off into each queue is blocking and runs concurrently across
    /// recipients: a full queue delays completion of this call but not
    /// delivery to the others. Queues closed in the meantime are skipped.
    /// Returns the number of queues that accepted the message.
    pub async fn broadcast(&self, msg: Message) -> Result<usize, AppError> {
        let recipients = self
            .request(|reply| RoomCommand::Recipients { reply })
            .await?;

        let deliveries = recipients.into_iter().map(|(client_id, queue)| {
            let msg = msg.clone();
            async move {
                match deliver(&queue, msg).await {
                    Ok(()) => true,
                    Err(e) => {
                        trace!("Skipping delivery to {}: {}", client_id, e);
                        false
                    }
                }
            }
        });

        let delivered = join_all(deliveries)
            .await
            .into_iter()
            .filter(|ok| *ok)
            .count();
        Ok(delivered)
    }

    /// Unregister a client, closing the room's end of its queue
    ///
    /// Returns false if the client was not a member.
    pub(crate) async fn leave(&self, client_id: ClientId) -> Result<bool, AppError> {
        self.request(|reply| RoomCommand::Leave { client_id, reply })
            .await
    }

    pub async fn member_count(&self) -> Result<usize, AppError> {
        self.request(|reply| RoomCommand::MemberCount { reply })
            .await
    }
}

/// Blocking hand-off into one client queue
async fn deliver(queue: &mpsc::Sender<Message>, msg: Message) -> Result<(), SendError> {
    queue.send(msg).await.map_err(|_| SendError::ChannelClosed)
}
