//! Wire types for the P2C marketplace REST and event-stream surfaces.

use serde::{Deserialize, Serialize};

/// Payment as published on the realtime list (`list:snapshot` / `list:update` frames).
///
/// Amounts are decimal strings in the asset's natural units; `fee_amount` is
/// denominated in 10^18 minor units of `out_asset`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LivePayment {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub payload: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub brand_name: String,
    #[serde(default)]
    pub in_asset: String,
    #[serde(default)]
    pub out_asset: String,
    #[serde(default)]
    pub boost: f64,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub in_amount: String,
    #[serde(default)]
    pub out_amount: String,
    #[serde(default)]
    pub exchange_rate: String,
    #[serde(default)]
    pub fee_amount: String,
    #[serde(default)]
    pub expires_at: String,
}

/// One delta from a `list:update` frame. `remove` identifies its victim by
/// position, not id.
#[derive(Debug, Clone, Deserialize)]
pub struct ListUpdate {
    pub op: String,
    #[serde(default)]
    pub data: Option<LivePayment>,
    #[serde(default)]
    pub pos: Option<i64>,
}

/// Payment status on the polling REST surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Processing,
    Completed,
    Disputed,
    Canceled,
    Refunded,
    #[serde(other)]
    Unknown,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Processing => "processing",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Disputed => "disputed",
            PaymentStatus::Canceled => "canceled",
            PaymentStatus::Refunded => "refunded",
            PaymentStatus::Unknown => "unknown",
        }
    }

    /// Terminal statuses are never worth racing for.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Completed
                | PaymentStatus::Disputed
                | PaymentStatus::Canceled
                | PaymentStatus::Refunded
        )
    }
}

/// Payment record from `GET /p2c/payments`. The upstream sends `id` as a JSON
/// number here, unlike the opaque string ids on the event stream.
#[derive(Debug, Clone, Deserialize)]
pub struct Payment {
    pub id: serde_json::Number,
    #[serde(default)]
    pub out_asset: String,
    #[serde(default)]
    pub out_amount: String,
    #[serde(default)]
    pub in_amount: String,
    #[serde(default)]
    pub in_asset: String,
    #[serde(default)]
    pub exchange_rate: String,
    #[serde(default)]
    pub reward_amount: String,
    pub status: PaymentStatus,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub brand_name: String,
}

impl Payment {
    pub fn id_string(&self) -> String {
        self.id.to_string()
    }

    /// Fiat amount as a float; unparsable amounts read as zero.
    pub fn in_amount_value(&self) -> f64 {
        self.in_amount.parse().unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListPaymentsResponse {
    #[serde(default)]
    pub data: Vec<Payment>,
    #[serde(default)]
    pub cursor: String,
}

#[derive(Debug, Clone, Default)]
pub struct ListParams {
    pub size: u32,
    pub status: Option<PaymentStatus>,
    pub cursor: String,
}

/// Body of a successful `POST /p2c/payments/take/{id}`.
#[derive(Debug, Deserialize)]
pub struct AcceptResponse {
    #[serde(default)]
    pub data: Option<AcceptData>,
}

#[derive(Debug, Deserialize)]
pub struct AcceptData {
    pub id: serde_json::Number,
}

/// Outcome of a successful accept, with the diagnostics the upstream attaches.
#[derive(Debug, Clone)]
pub struct Accepted {
    /// Numeric id required by complete/cancel; absent when the body did not
    /// carry one.
    pub numeric_id: Option<i64>,
    /// `CF-RAY` response header, when present.
    pub cf_ray: Option<String>,
    /// Raw response body, kept for logging.
    pub body: String,
}
