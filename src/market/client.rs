//! Typed REST client for the P2C marketplace.
//!
//! Auth is a cookie `access_token=<token>` on every request. The race-accept
//! call is latency-sensitive, so the client keeps tight 2 s budgets and a
//! warm connection pool.

use async_trait::async_trait;
use reqwest::{Client, Method};
use std::time::Duration;

use super::error::{MarketError, classify_rejection};
use super::types::{AcceptResponse, Accepted, ListParams, ListPaymentsResponse};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
const MAX_REDIRECTS: usize = 3;

/// Capability surface of the marketplace REST API. Workers depend on this
/// trait so the accept path can be exercised against a mock upstream.
#[async_trait]
pub trait MarketApi: Send + Sync {
    async fn list_payments(&self, params: &ListParams)
    -> Result<ListPaymentsResponse, MarketError>;

    /// Race to accept a published payment by its stream id.
    async fn accept(&self, stream_id: &str) -> Result<Accepted, MarketError>;

    /// Confirm a payment by its numeric id, paying out via `merchant_account_id`.
    async fn complete(&self, id: &str, merchant_account_id: &str) -> Result<(), MarketError>;

    /// Cancel a payment by its numeric id.
    async fn cancel(&self, id: &str, reason: &str) -> Result<(), MarketError>;
}

pub struct MarketClient {
    client: Client,
    base_url: String,
    access_token: String,
}

impl MarketClient {
    pub fn new(base_url: &str, access_token: &str) -> Result<Self, MarketError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(REQUEST_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .map_err(|e| MarketError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token: access_token.to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    /// Prime DNS/TLS/keepalive before the first race; the result is ignored.
    pub async fn warmup(&self) {
        let _ = self.request(Method::GET, "/health").send().await;
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .request(method, format!("{}{}", self.base_url, path))
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if !self.access_token.is_empty() {
            req = req.header(
                reqwest::header::COOKIE,
                format!("access_token={}", self.access_token),
            );
        }
        req
    }

    /// Drain a non-2xx response into a classified error, body included.
    async fn expect_ok(response: reqwest::Response) -> Result<reqwest::Response, MarketError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_rejection(status.as_u16(), body))
    }
}

#[async_trait]
impl MarketApi for MarketClient {
    async fn list_payments(
        &self,
        params: &ListParams,
    ) -> Result<ListPaymentsResponse, MarketError> {
        let mut req = self.request(Method::GET, "/p2c/payments");
        if params.size > 0 {
            req = req.query(&[("size", params.size.to_string())]);
        }
        if let Some(status) = params.status {
            req = req.query(&[("status", status.as_str())]);
        }
        if !params.cursor.is_empty() {
            req = req.query(&[("cursor", params.cursor.as_str())]);
        }

        let response = Self::expect_ok(req.send().await?).await?;
        let out = response.json::<ListPaymentsResponse>().await?;
        Ok(out)
    }

    async fn accept(&self, stream_id: &str) -> Result<Accepted, MarketError> {
        if stream_id.is_empty() {
            return Err(MarketError::EmptyPaymentId);
        }
        let response = self
            .request(Method::POST, &format!("/p2c/payments/take/{stream_id}"))
            .send()
            .await?;

        // CF-RAY and the body are both captured before the response is
        // consumed, success or not.
        let status = response.status();
        let cf_ray = response
            .headers()
            .get("CF-RAY")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(classify_rejection(status.as_u16(), body));
        }

        let numeric_id = serde_json::from_str::<AcceptResponse>(&body)
            .ok()
            .and_then(|r| r.data)
            .and_then(|d| d.id.as_i64());
        Ok(Accepted {
            numeric_id,
            cf_ray,
            body,
        })
    }

    async fn complete(&self, id: &str, merchant_account_id: &str) -> Result<(), MarketError> {
        if id.is_empty() {
            return Err(MarketError::EmptyPaymentId);
        }
        let response = self
            .request(Method::POST, &format!("/p2c/payments/{id}/complete"))
            .json(&serde_json::json!({ "method": merchant_account_id }))
            .send()
            .await?;
        Self::expect_ok(response).await?;
        Ok(())
    }

    async fn cancel(&self, id: &str, reason: &str) -> Result<(), MarketError> {
        if id.is_empty() {
            return Err(MarketError::EmptyPaymentId);
        }
        let response = self
            .request(Method::POST, &format!("/p2c/payments/{id}/cancel"))
            .json(&serde_json::json!({ "reason": reason }))
            .send()
            .await?;
        Self::expect_ok(response).await?;
        Ok(())
    }
}
