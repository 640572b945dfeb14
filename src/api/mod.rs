//! Control-plane HTTP surface.
//!
//! | Path | Method | Effect |
//! |------|--------|--------|
//! | /health | GET | liveness probe |
//! | /accounts/reload | POST | reconcile one account's worker |
//! | /orders/take | POST | manual-mode take |
//! | /payments/complete | POST | confirm an accepted payment |
//! | /payments/cancel | POST | cancel an accepted payment |

mod handler;

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;

use crate::engine::Manager;

pub fn router(manager: Arc<Manager>) -> Router {
    Router::new()
        .route("/health", get(handler::health))
        .route("/accounts/reload", post(handler::reload_account))
        .route("/orders/take", post(handler::take_order))
        .route("/payments/complete", post(handler::complete_payment))
        .route("/payments/cancel", post(handler::cancel_payment))
        .with_state(manager)
}
