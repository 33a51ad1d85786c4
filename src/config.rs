//! Server configuration
//!
//! Defaults match the deployed relay; every value can be overridden
//! through `CHAT_*` environment variables.
//!
//! The default origin allow-list is empty, which accepts cross-site
//! WebSocket handshakes from any page. Deployments reachable from a
//! browser should set `CHAT_ALLOWED_ORIGINS` to the site(s) serving the
//! chat client.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::AppError;

/// Default server address
pub const DEFAULT_ADDR: &str = "127.0.0.1:9990";

/// How a connection proves its identity before entering the room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMode {
    /// Hello enters the room immediately
    #[default]
    Direct,
    /// Hello issues a login code; an auth message redeems it
    LoginCode,
}

impl FromStr for AuthMode {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "code" | "login_code" => Ok(Self::LoginCode),
            other => Err(AppError::Config(format!("unknown auth mode '{}'", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address
    pub addr: String,
    pub auth_mode: AuthMode,
    /// A connection with no inbound frame for this long is dropped
    pub idle_timeout: Duration,
    /// Ping period; must be shorter than `idle_timeout`
    pub keepalive_interval: Duration,
    pub login_code_ttl: Duration,
    /// Capacity of each client's delivery queue
    pub queue_capacity: usize,
    pub rate_limit_burst: u32,
    pub rate_limit_per_sec: f64,
    /// Longer chat text is truncated to this many characters
    pub max_text_len: usize,
    /// Maximum length of a name or email, in characters
    pub max_field_len: usize,
    /// Accepted `Origin` headers, from `CHAT_ALLOWED_ORIGINS`
    /// (comma-separated)
    ///
    /// Empty accepts any origin, including none. Set this in production.
    pub allowed_origins: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            auth_mode: AuthMode::Direct,
            idle_timeout: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(50),
            login_code_ttl: Duration::from_secs(10 * 60),
            queue_capacity: 64,
            rate_limit_burst: 1,
            rate_limit_per_sec: 10.0,
            max_text_len: 65536,
            max_field_len: 120,
            allowed_origins: Vec::new(),
        }
    }
}

impl Config {
    /// Build a configuration from the process environment
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let mut config = Self::default();

        if let Some(addr) = lookup("CHAT_ADDR") {
            config.addr = addr;
        }
        if let Some(mode) = lookup("CHAT_AUTH_MODE") {
            config.auth_mode = mode.parse()?;
        }
        if let Some(secs) = lookup("CHAT_IDLE_TIMEOUT_SECS") {
            config.idle_timeout = Duration::from_secs(parse_number("CHAT_IDLE_TIMEOUT_SECS", &secs)?);
        }
        if let Some(secs) = lookup("CHAT_KEEPALIVE_SECS") {
            config.keepalive_interval = Duration::from_secs(parse_number("CHAT_KEEPALIVE_SECS", &secs)?);
        }
        if let Some(secs) = lookup("CHAT_LOGIN_CODE_TTL_SECS") {
            config.login_code_ttl = Duration::from_secs(parse_number("CHAT_LOGIN_CODE_TTL_SECS", &secs)?);
        }
        if let Some(capacity) = lookup("CHAT_QUEUE_CAPACITY") {
            config.queue_capacity = parse_number("CHAT_QUEUE_CAPACITY", &capacity)?;
        }
        if let Some(origins) = lookup("CHAT_ALLOWED_ORIGINS") {
            config.allowed_origins = origins
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(String::from)
                .collect();
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.keepalive_interval.is_zero() || self.keepalive_interval >= self.idle_timeout {
            return Err(AppError::Config(
                "keepalive interval must be non-zero and shorter than the idle timeout".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(AppError::Config("queue capacity must be positive".to_string()));
        }
        Ok(())
    }

    /// True when no origin allow-list is configured
    pub fn accepts_any_origin(&self) -> bool {
        self.allowed_origins.is_empty()
    }

    /// Whether a handshake with this `Origin` header may proceed
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        if self.accepts_any_origin() {
            return true;
        }
        origin.is_some_and(|origin| self.allowed_origins.iter().any(|allowed| allowed == origin))
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T, AppError> {
    value
        .trim()
        .parse()
        .map_err(|_| AppError::Config(format!("{} must be a number, got '{}'", key, value)))
}
