//! Room state
//!
//! The single broadcast room: who is connected, and which names are
//! reserved under which email. Owned exclusively by the `RoomServer`
//! actor, so none of this needs locking.

use std::collections::HashMap;

use tokio::sync::mpsc;

use crate::error::AppError;
use crate::message::{Message, User};
use crate::types::ClientId;

/// A registered client: identity plus the sending half of its queue
#[derive(Debug)]
struct Member {
    user: User,
    queue: mpsc::Sender<Message>,
}

/// A reserved name
///
/// The name is bound to one email while at least one client holds it.
/// Several clients may hold the same name with the same email
/// (e.g. a reconnect racing the old connection's teardown).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub email: String,
    pub holders: usize,
}

/// Shared chat room
///
/// Invariant: a name key is present in `names` iff at least one member
/// holds it, and its `holders` count equals the number of such members.
#[derive(Debug, Default)]
pub struct Room {
    members: HashMap<ClientId, Member>,
    names: HashMap<String, Reservation>,
}

impl Room {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether `user` may enter
    ///
    /// A held name may be entered again only with the same non-empty
    /// email. A name held without an email is exclusive.
    pub fn can_enter(&self, user: &User) -> bool {
        match self.names.get(&user.name_key()) {
            Some(reservation) => {
                !reservation.email.is_empty()
                    && user.has_email()
                    && reservation.email.eq_ignore_ascii_case(&user.email)
            }
            None => true,
        }
    }

    /// Register a client and reserve its name
    ///
    /// Admission is re-checked here so that check and registration are
    /// one step.
    pub fn enter(
        &mut self,
        client_id: ClientId,
        user: User,
        queue: mpsc::Sender<Message>,
    ) -> Result<(), AppError> {
        if !self.can_enter(&user) {
            return Err(AppError::EntryDenied(user.name));
        }

        self.names
            .entry(user.name_key())
            .or_insert_with(|| Reservation {
                email: user.email.clone(),
                holders: 0,
            })
            .holders += 1;
        self.members.insert(client_id, Member { user, queue });
        Ok(())
    }

    /// Unregister a client
    ///
    /// Drops the room's sending half of the client's queue and frees the
    /// name once its last holder is gone. Returns the departed user, or
    /// None if the client was not a member.
    pub fn leave(&mut self, client_id: ClientId) -> Option<User> {
        let member = self.members.remove(&client_id)?;
        let key = member.user.name_key();

        if let Some(reservation) = self.names.get_mut(&key) {
            reservation.holders = reservation.holders.saturating_sub(1);
            if reservation.holders == 0 {
                self.names.remove(&key);
            }
        }

        Some(member.user)
    }

    /// Snapshot of every member's queue
    pub fn recipients(&self) -> Vec<(ClientId, mpsc::Sender<Message>)> {
        self.members
            .iter()
            .map(|(id, member)| (*id, member.queue.clone()))
            .collect()
    }

    pub fn contains(&self, client_id: ClientId) -> bool {
        self.members.contains_key(&client_id)
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Look up the reservation for a name (case-insensitive)
    pub fn reservation(&self, name: &str) -> Option<&Reservation> {
        self.names.get(&name.to_lowercase())
    }
}
