//! Login codes
//!
//! Short-lived, single-use credentials for the two-step entry flow.
//! A hello issues a code bound to the pending user; an auth message
//! redeems it. Each code owns a timer task that reaps it at expiry, and
//! removing the code any other way aborts that task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::message::User;
use crate::types::LoginCode;

/// Out-of-band channel that gets a freshly issued code to its user
pub trait CodeDelivery: Send + Sync {
    fn deliver(&self, user: &User, code: &LoginCode);
}

/// Delivery that writes the code to the server log
///
/// Stands in for email delivery; operators read the code from the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDelivery;

impl CodeDelivery for LogDelivery {
    fn deliver(&self, user: &User, code: &LoginCode) {
        info!("Login code for @{} <{}>: {}", user.name, user.email, code);
    }
}

struct PendingLogin {
    user: User,
    expires_at: Instant,
    expiry: JoinHandle<()>,
}

impl Drop for PendingLogin {
    fn drop(&mut self) {
        self.expiry.abort();
    }
}

type CodeTable = HashMap<LoginCode, PendingLogin>;

fn lock(codes: &Mutex<CodeTable>) -> MutexGuard<'_, CodeTable> {
    codes.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registry of outstanding login codes
#[derive(Clone)]
pub struct LoginCodes {
    codes: Arc<Mutex<CodeTable>>,
    ttl: Duration,
}

impl LoginCodes {
    pub fn new(ttl: Duration) -> Self {
        Self {
            codes: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    /// Issue a fresh code for `user`, valid for the registry's TTL
    ///
    /// Must be called from within a tokio runtime (spawns the expiry task).
    pub fn issue(&self, user: User) -> LoginCode {
        let mut codes = lock(&self.codes);

        let code = loop {
            let code = LoginCode::generate();
            if !codes.contains_key(&code) {
                break code;
            }
        };

        let expires_at = Instant::now() + self.ttl;
        let expiry = tokio::spawn(expire(
            Arc::downgrade(&self.codes),
            code.clone(),
            expires_at,
        ));

        debug!("Issued login code for @{}", user.name);
        codes.insert(
            code.clone(),
            PendingLogin {
                user,
                expires_at,
                expiry,
            },
        );

        code
    }

    /// Redeem a code (case-insensitive)
    ///
    /// A code is removed on first use, so a replay returns None.
    pub fn consume(&self, token: &str) -> Option<User> {
        let code = LoginCode::from_input(token);
        let mut pending = lock(&self.codes).remove(&code)?;

        if pending.expires_at <= Instant::now() {
            debug!("Login code {} presented after expiry", code);
            return None;
        }

        Some(std::mem::take(&mut pending.user))
    }

    /// Number of outstanding codes
    pub fn len(&self) -> usize {
        lock(&self.codes).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Expiry task for one code
async fn expire(codes: Weak<Mutex<CodeTable>>, code: LoginCode, deadline: Instant) {
    tokio::time::sleep_until(deadline).await;

    let Some(codes) = codes.upgrade() else {
        return;
    };

    let removed = {
        let mut table = lock(&codes);
        match table.get(&code) {
            Some(pending) if pending.expires_at == deadline => table.remove(&code),
            _ => None,
        }
    };

    if let Some(pending) = removed {
        debug!("Login code for @{} expired", pending.user.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(600);

    fn alice() -> User {
        User::new("alice", "a@x.com")
    }

    #[tokio::test]
    async fn test_issue_and_consume() {
        let codes = LoginCodes::new(TTL);
        let code = codes.issue(alice());

        assert_eq!(codes.len(), 1);
        assert_eq!(codes.consume(code.as_str()), Some(alice()));
        assert!(codes.is_empty());
    }

    #[tokio::test]
    async fn test_code_is_single_use() {
        let codes = LoginCodes::new(TTL);
        let code = codes.issue(alice());

        assert!(codes.consume(code.as_str()).is_some());
        assert!(codes.consume(code.as_str()).is_none());
    }

    #[tokio::test]
    async fn test_consume_is_case_insensitive() {
        let codes = LoginCodes::new(TTL);
        let code = codes.issue(alice());

        let typed = format!(" {} ", code.as_str().to_lowercase());
        assert_eq!(codes.consume(&typed), Some(alice()));
    }

    #[tokio::test]
    async fn test_unknown_code() {
        let codes = LoginCodes::new(TTL);
        codes.issue(alice());

        assert!(codes.consume("nope").is_none());
        assert_eq!(codes.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_code_valid_before_expiry() {
        let codes = LoginCodes::new(TTL);
        let code = codes.issue(alice());

        tokio::time::advance(Duration::from_secs(9 * 60)).await;

        assert_eq!(codes.consume(code.as_str()), Some(alice()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_code_rejected_after_expiry() {
        let codes = LoginCodes::new(TTL);
        let code = codes.issue(alice());

        tokio::time::sleep(TTL + Duration::from_secs(1)).await;

        assert!(codes.is_empty());
        assert!(codes.consume(code.as_str()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_code_rejected_just_past_deadline() {
        let codes = LoginCodes::new(TTL);
        let code = codes.issue(alice());

        tokio::time::advance(TTL + Duration::from_millis(1)).await;

        assert!(codes.consume(code.as_str()).is_none());
    }
}
