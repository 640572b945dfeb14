//! Control-plane handlers: decode JSON, call the manager, acknowledge.

use axum::{Json, extract::State, http::StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

use crate::engine::{Manager, WorkerConfig};

/// GET /health
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
pub struct ReloadRequest {
    #[serde(default)]
    account_id: i64,
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    chat_id: i64,
    #[serde(default)]
    min_amount: Option<f64>,
    #[serde(default)]
    max_amount: Option<f64>,
    #[serde(default)]
    auto_mode: Option<bool>,
    #[serde(default)]
    is_active: Option<bool>,
    #[serde(default)]
    merchant_account_id: Option<String>,
}

/// POST /accounts/reload
pub async fn reload_account(
    State(manager): State<Arc<Manager>>,
    Json(req): Json<ReloadRequest>,
) -> (StatusCode, Json<Value>) {
    if req.account_id == 0 {
        return (StatusCode::BAD_REQUEST, Json(json!({ "status": "error" })));
    }
    let cfg = WorkerConfig {
        account_id: req.account_id,
        access_token: req.access_token,
        merchant_account_id: req.merchant_account_id.unwrap_or_default(),
        chat_id: req.chat_id,
        min_amount: req.min_amount,
        max_amount: req.max_amount,
        // Absent booleans keep their defaults: an account reloads active,
        // auto mode stays off until requested explicitly.
        auto_mode: req.auto_mode.unwrap_or(false),
        active: req.is_active.unwrap_or(true),
    };
    match manager.reload_account(cfg).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "status": "reloaded", "ok": true })),
        ),
        Err(e) => {
            tracing::error!(account = req.account_id, error = %e, "reload failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "status": "error" })),
            )
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TakeOrderRequest {
    #[serde(default)]
    account_id: i64,
    #[serde(default)]
    order_external_id: String,
}

/// POST /orders/take
pub async fn take_order(
    State(manager): State<Arc<Manager>>,
    Json(req): Json<TakeOrderRequest>,
) -> (StatusCode, Json<Value>) {
    if req.account_id == 0 || req.order_external_id.is_empty() {
        return (StatusCode::BAD_REQUEST, Json(json!({ "status": "error" })));
    }
    match manager
        .take_order(req.account_id, &req.order_external_id)
        .await
    {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ok" }))),
        Err(e) => {
            tracing::error!(account = req.account_id, error = %e, "take order failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "status": "error" })),
            )
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PaymentRequest {
    #[serde(default)]
    account_id: i64,
    #[serde(default)]
    payment_id: String,
}

/// POST /payments/complete
pub async fn complete_payment(
    State(manager): State<Arc<Manager>>,
    Json(req): Json<PaymentRequest>,
) -> (StatusCode, Json<Value>) {
    if req.account_id == 0 || req.payment_id.is_empty() {
        return (StatusCode::BAD_REQUEST, Json(json!({ "status": "error" })));
    }
    match manager
        .complete_payment(req.account_id, &req.payment_id)
        .await
    {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ok" }))),
        Err(e) => {
            tracing::error!(account = req.account_id, error = %e, "complete payment failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "status": "error" })),
            )
        }
    }
}

/// POST /payments/cancel
pub async fn cancel_payment(
    State(manager): State<Arc<Manager>>,
    Json(req): Json<PaymentRequest>,
) -> (StatusCode, Json<Value>) {
    if req.account_id == 0 || req.payment_id.is_empty() {
        return (StatusCode::BAD_REQUEST, Json(json!({ "status": "error" })));
    }
    match manager.cancel_payment(req.account_id, &req.payment_id).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ok" }))),
        Err(e) => {
            tracing::error!(account = req.account_id, error = %e, "cancel payment failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "status": "error" })),
            )
        }
    }
}
