//! P2C Engine — automated order acquisition for a P2P payment marketplace.
//!
//! Per merchant account the engine keeps a realtime subscription to the
//! marketplace's event stream, races to accept newly published payments that
//! fit the account's filters, and relays accepted payments to an operator
//! Telegram chat for confirmation or cancellation. A small HTTP control plane
//! accepts per-account configuration and manual-mode commands.
//!
//! # Module structure
//!
//! ```text
//! src/
//! ├── core/      # configuration
//! ├── market/    # upstream REST client, error taxonomy, event subscription
//! ├── engine/    # per-account workers + manager
//! ├── telegram/  # operator-chat notifications
//! ├── api/       # control-plane HTTP routes
//! └── utils/     # logging
//! ```

pub mod api;
pub mod core;
pub mod engine;
pub mod market;
pub mod telegram;
pub mod utils;

pub use crate::core::Config;
pub use crate::engine::{Manager, Worker, WorkerConfig};
pub use crate::market::{MarketClient, MarketError};
pub use crate::telegram::{Notifier, Notify};
pub use crate::utils::init_logger;
