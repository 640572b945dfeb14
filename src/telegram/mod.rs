//! Operator-chat notifications via the Telegram Bot API.
//!
//! Outbound only: text messages and photo messages with an inline keyboard.
//! Failures are reported to the caller and never retried here; the worker
//! decides whether to fall back from photo to plain text.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::market::types::{LivePayment, Payment};

const TELEGRAM_API: &str = "https://api.telegram.org";
/// `fee_amount` wire values are 10^18 minor units of the output asset.
const MINOR_UNITS: f64 = 1e18;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notifier not configured: {0}")]
    NotConfigured(&'static str),
    #[error("telegram request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("telegram status {0}")]
    Status(u16),
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct InlineButton {
    pub text: String,
    pub callback_data: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct InlineKeyboard {
    pub inline_keyboard: Vec<Vec<InlineButton>>,
}

/// Capability to reach the operator chat. Workers depend on the trait so
/// notification behavior is testable with a recording mock.
#[async_trait]
pub trait Notify: Send + Sync {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), NotifyError>;

    async fn send_photo(
        &self,
        chat_id: i64,
        photo_url: &str,
        caption: &str,
        reply_markup: Option<InlineKeyboard>,
    ) -> Result<(), NotifyError>;
}

pub struct Notifier {
    http: Client,
    bot_token: String,
}

impl Notifier {
    pub fn new(bot_token: &str) -> Self {
        Self {
            http: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            bot_token: bot_token.to_string(),
        }
    }

    fn check(&self, chat_id: i64) -> Result<(), NotifyError> {
        if self.bot_token.is_empty() {
            return Err(NotifyError::NotConfigured("empty bot token"));
        }
        if chat_id == 0 {
            return Err(NotifyError::NotConfigured("empty chat id"));
        }
        Ok(())
    }

    async fn post(&self, method: &str, body: serde_json::Value) -> Result<(), NotifyError> {
        let url = format!("{TELEGRAM_API}/bot{}/{method}", self.bot_token);
        let response = self.http.post(&url).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status(status.as_u16()));
        }
        Ok(())
    }
}

#[async_trait]
impl Notify for Notifier {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<(), NotifyError> {
        self.check(chat_id)?;
        self.post(
            "sendMessage",
            serde_json::json!({
                "chat_id": chat_id,
                "text": text,
                "parse_mode": "HTML",
            }),
        )
        .await
    }

    async fn send_photo(
        &self,
        chat_id: i64,
        photo_url: &str,
        caption: &str,
        reply_markup: Option<InlineKeyboard>,
    ) -> Result<(), NotifyError> {
        self.check(chat_id)?;
        let mut body = serde_json::json!({
            "chat_id": chat_id,
            "photo": photo_url,
        });
        if !caption.is_empty() {
            body["caption"] = caption.into();
            body["parse_mode"] = "HTML".into();
        }
        if let Some(markup) = reply_markup {
            if let Ok(value) = serde_json::to_value(markup) {
                body["reply_markup"] = value;
            }
        }
        self.post("sendPhoto", body).await
    }
}

// ---------------------------------------------------------------------------
// Message builders
// ---------------------------------------------------------------------------

/// QR image URL for a payment link. Spaces must render as `%20`, never `+`:
/// the QR service decodes `+` literally.
pub fn qr_url(payment_url: &str) -> String {
    format!(
        "https://quickchart.io/qr?text={}&size=200",
        urlencoding::encode(payment_url)
    )
}

/// Convert a raw 10^18-minor-unit amount to the asset's natural units.
pub fn from_minor_units(raw: &str) -> f64 {
    raw.parse::<f64>().map(|v| v / MINOR_UNITS).unwrap_or(0.0)
}

/// Caption for an accepted stream payment.
pub fn live_caption(p: &LivePayment, status: &str) -> String {
    let mut out = String::new();
    if !status.is_empty() {
        out.push_str(status);
        out.push('\n');
    }
    out.push_str(&format!("ID: {}\n", p.id));
    let fee = from_minor_units(&p.fee_amount);
    let out_asset = if p.out_asset.is_empty() {
        "USDT"
    } else {
        &p.out_asset
    };
    out.push_str(&format!("Бренд: {}\n", p.brand_name));
    out.push_str(&format!("Сумма: {} {}\n", p.in_amount, p.in_asset));
    out.push_str(&format!("Курс: {}\n", p.exchange_rate));
    out.push_str(&format!("Вознаграждение: {fee:.4} {out_asset}\n"));
    out
}

/// Plain-text message for the polling path.
pub fn poll_message(p: &Payment, success: bool, err_text: &str) -> String {
    let out_amount = from_minor_units(&p.out_amount);
    let reward = from_minor_units(&p.reward_amount);

    let mut out = String::new();
    if success {
        out.push_str("🤖 Заявка взята автоматически ✅\n");
    } else {
        out.push_str("⚠️ Не удалось взять заявку\n");
    }
    out.push_str(&format!("Бренд: {}\n", p.brand_name));
    out.push_str(&format!("Сумма: {} {}\n", p.in_amount, p.in_asset));
    out.push_str(&format!("Получает: {out_amount:.6} {}\n", p.out_asset));
    out.push_str(&format!("Курс: {}\n", p.exchange_rate));
    out.push_str(&format!("Вознаграждение: {reward:.6} {}\n", p.out_asset));
    if !p.url.is_empty() {
        out.push_str(&format!("QR: {}\n", p.url));
    }
    out.push_str(&format!("ID: {}\n", p.id_string()));
    if !success && !err_text.is_empty() {
        out.push_str(&format!("Ошибка: {err_text}\n"));
    }
    out
}

/// Inline keyboard for an accepted payment. The callback payloads are decoded
/// by the control-plane side of the operator bot:
/// `paid:<account_id>:<stream_id>:<in_amount>:<exchange_rate>:<fee_amount>`
/// and `cancel:<account_id>:<stream_id>`.
pub fn paid_keyboard(account_id: i64, p: &LivePayment) -> Option<InlineKeyboard> {
    if p.id.is_empty() || account_id == 0 {
        return None;
    }
    let paid = format!(
        "paid:{}:{}:{}:{}:{}",
        account_id, p.id, p.in_amount, p.exchange_rate, p.fee_amount
    );
    let cancel = format!("cancel:{}:{}", account_id, p.id);
    Some(InlineKeyboard {
        inline_keyboard: vec![vec![
            InlineButton {
                text: "✅ Я оплатил".into(),
                callback_data: paid,
            },
            InlineButton {
                text: "❌ Отменить".into(),
                callback_data: cancel,
            },
        ]],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live_payment() -> LivePayment {
        LivePayment {
            id: "A".into(),
            brand_name: "shop".into(),
            in_asset: "RUB".into(),
            in_amount: "500".into(),
            out_asset: "USDT".into(),
            exchange_rate: "92.5".into(),
            fee_amount: "2500000000000000000".into(),
            url: "https://pay.example/x y".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_qr_url_encodes_spaces_as_percent20() {
        let url = qr_url("https://pay.example/x y?a=b c");
        assert!(url.contains("%20"));
        assert!(!url.contains('+'));
        assert!(url.starts_with("https://quickchart.io/qr?text="));
        assert!(url.ends_with("&size=200"));
        assert!(url.contains("https%3A%2F%2Fpay.example%2Fx%20y%3Fa%3Db%20c"));
    }

    #[test]
    fn test_from_minor_units() {
        assert_eq!(from_minor_units("2500000000000000000"), 2.5);
        assert_eq!(from_minor_units(""), 0.0);
        assert_eq!(from_minor_units("nonsense"), 0.0);
    }

    #[test]
    fn test_paid_keyboard_payloads() {
        let kb = paid_keyboard(42, &live_payment()).unwrap();
        let row = &kb.inline_keyboard[0];
        assert_eq!(row.len(), 2);
        assert_eq!(row[0].callback_data, "paid:42:A:500:92.5:2500000000000000000");
        assert_eq!(row[1].callback_data, "cancel:42:A");
    }

    #[test]
    fn test_paid_keyboard_requires_id_and_account() {
        let mut p = live_payment();
        p.id.clear();
        assert!(paid_keyboard(42, &p).is_none());
        assert!(paid_keyboard(0, &live_payment()).is_none());
    }

    #[test]
    fn test_keyboard_wire_shape() {
        let kb = paid_keyboard(1, &live_payment()).unwrap();
        let json = serde_json::to_value(&kb).unwrap();
        assert!(json["inline_keyboard"][0][0]["callback_data"].is_string());
        assert_eq!(json["inline_keyboard"][0][1]["text"], "❌ Отменить");
    }

    #[test]
    fn test_live_caption_divides_fee() {
        let caption = live_caption(&live_payment(), "🤖 Заявка принята автоматически ✅");
        assert!(caption.starts_with("🤖 Заявка принята автоматически ✅\n"));
        assert!(caption.contains("ID: A\n"));
        assert!(caption.contains("Сумма: 500 RUB\n"));
        assert!(caption.contains("Вознаграждение: 2.5000 USDT\n"));
    }

    #[test]
    fn test_live_caption_defaults_out_asset() {
        let mut p = live_payment();
        p.out_asset.clear();
        let caption = live_caption(&p, "");
        assert!(caption.contains("Вознаграждение: 2.5000 USDT\n"));
    }

    #[tokio::test]
    async fn test_unconfigured_notifier_refuses() {
        let notifier = Notifier::new("");
        let err = notifier.send_text(1, "hi").await.unwrap_err();
        assert!(matches!(err, NotifyError::NotConfigured(_)));

        let notifier = Notifier::new("token");
        let err = notifier.send_text(0, "hi").await.unwrap_err();
        assert!(matches!(err, NotifyError::NotConfigured(_)));
    }
}
