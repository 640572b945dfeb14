//! Marketplace integration — REST client, error taxonomy, event subscription.
//!
//! ```text
//! market/
//!   ├── client  # typed REST surface (list / accept / complete / cancel)
//!   ├── error   # structured upstream rejections
//!   ├── socket  # event-stream driver + virtual-list reducer
//!   └── types   # wire structs
//! ```

pub mod client;
pub mod error;
pub mod socket;
pub mod types;

pub use client::{MarketApi, MarketClient};
pub use error::MarketError;
pub use socket::{LiveHandler, subscribe};
pub use types::{Accepted, ListParams, LivePayment, Payment, PaymentStatus};
