//! Engine configuration.
//!
//! All settings come from the environment, read once at startup:
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | ENGINE_ADDR | `:8080` | control-plane listen address |
//! | P2C_BASE_URL | `https://app.cr.bot/internal/v1` | upstream REST/event base |
//! | P2C_BOT_TOKEN | — | operator-chat bot credential (falls back to BOT_TOKEN) |
//! | LOG_LEVEL | `info` | tracing level |
//! | P2C_POLL_INTERVAL_SECS | unset | enables the diagnostic polling path |

use std::net::{AddrParseError, SocketAddr};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Control-plane listen address; a bare `:port` binds all interfaces.
    pub addr: String,
    /// Upstream REST and event-stream base URL.
    pub base_url: String,
    /// Telegram bot token; empty disables operator notifications.
    pub bot_token: String,
    pub log_level: String,
    /// Polling-path interval; `None` leaves the event stream as the only path.
    pub poll_interval: Option<Duration>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            addr: std::env::var("ENGINE_ADDR").unwrap_or_else(|_| ":8080".into()),
            base_url: std::env::var("P2C_BASE_URL")
                .unwrap_or_else(|_| "https://app.cr.bot/internal/v1".into()),
            bot_token: std::env::var("P2C_BOT_TOKEN")
                .or_else(|_| std::env::var("BOT_TOKEN"))
                .unwrap_or_default(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
            poll_interval: std::env::var("P2C_POLL_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs),
        }
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, AddrParseError> {
        if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr).parse()
        } else {
            self.addr.parse()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}
