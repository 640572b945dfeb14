//! Marketplace error taxonomy.
//!
//! The upstream reports its two semantic rejections (`MerchantPenalized`,
//! `ActiveOrderExists`) inside non-2xx bodies rather than via status codes,
//! so non-2xx responses are classified here into structured variants. The raw
//! body stays inside every variant's display form so logs keep the upstream's
//! exact words.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MarketError {
    /// Connect/read/write failure before a response was obtained.
    #[error("request failed: {0}")]
    Transport(String),

    /// Non-2xx response with no recognized semantic code in the body.
    #[error("status {status} body={body}")]
    Status { status: u16, body: String },

    /// The merchant already holds an order; the upstream refuses another.
    #[error("ActiveOrderExists body={body}")]
    ActiveOrderExists { body: String },

    /// Time-bounded server-side block on new accepts.
    #[error("MerchantPenalized kind={kind} body={body}")]
    MerchantPenalized {
        until: Option<DateTime<Utc>>,
        kind: String,
        body: String,
    },

    /// Handshake or framing violation on the event transport.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("empty payment id")]
    EmptyPaymentId,

    /// complete/cancel requested for an account with no payout method bound.
    #[error("no p2c account id configured")]
    NoMerchantAccount,
}

impl From<reqwest::Error> for MarketError {
    fn from(e: reqwest::Error) -> Self {
        MarketError::Transport(e.to_string())
    }
}

#[derive(Deserialize)]
struct RejectionBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    penalty_end_at: String,
    #[serde(default)]
    penalty_type: String,
}

/// Classify a non-2xx response body into a structured error.
pub fn classify_rejection(status: u16, body: String) -> MarketError {
    if let Ok(payload) = serde_json::from_str::<RejectionBody>(&body) {
        if payload.error == "MerchantPenalized" && !payload.penalty_end_at.is_empty() {
            let until = DateTime::parse_from_rfc3339(&payload.penalty_end_at)
                .ok()
                .map(|t| t.with_timezone(&Utc));
            return MarketError::MerchantPenalized {
                until,
                kind: payload.penalty_type,
                body,
            };
        }
    }
    // Non-JSON bodies still carry the codes as substrings. The fallback
    // needs both markers; a bare "MerchantPenalized" with no window is not a
    // penalty, it stays a generic rejection for the caller to log.
    if body.contains("MerchantPenalized") {
        if let Some(ts) = extract_quoted_after_key(&body, "penalty_end_at") {
            let until = DateTime::parse_from_rfc3339(&ts)
                .ok()
                .map(|t| t.with_timezone(&Utc));
            return MarketError::MerchantPenalized {
                until,
                kind: "unknown".into(),
                body,
            };
        }
    }
    if body.contains("ActiveOrderExists") {
        return MarketError::ActiveOrderExists { body };
    }
    MarketError::Status { status, body }
}

/// Pull the quoted value following `"<key>":` out of a JSON-ish blob.
fn extract_quoted_after_key(text: &str, key: &str) -> Option<String> {
    let idx = text.find(key)?;
    let rest = &text[idx + key.len()..];
    let colon = rest.find(':')?;
    let rest = &rest[colon + 1..];
    let open = rest.find('"')?;
    let rest = &rest[open + 1..];
    let close = rest.find('"')?;
    Some(rest[..close].to_string())
}
