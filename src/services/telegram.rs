//! Telegram admin notifications.
//!
//! Notifications are best-effort: callers spawn them onto a background task
//! and only log failures. An unconfigured client (no bot token or chat id)
//! silently drops every message so local setups work without credentials.

use std::time::Duration;

use serde_json::json;

const HTTP_TIMEOUT: Duration = Duration::from_secs(15);
const API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, thiserror::Error)]
pub enum TelegramError {
    #[error("telegram api returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct PaymentSuccessNotification {
    pub order_id: String,
    pub order_number: String,
    pub billz_order_id: String,
    pub amount: f64,
    pub currency: String,
}

#[derive(Debug, Clone)]
pub struct OrderItemNotification {
    pub name: String,
    pub quantity: f64,
    pub price: f64,
}

#[derive(Debug, Clone)]
pub struct OrderNotification {
    pub order_number: String,
    pub customer_name: String,
    pub customer_phone: String,
    pub payment_label: String,
    pub total: f64,
    pub items: Vec<OrderItemNotification>,
}

#[derive(Clone)]
pub struct TelegramClient {
    http: reqwest::Client,
    bot_token: String,
    admin_chat_id: String,
}

impl TelegramClient {
    pub fn new(bot_token: String, admin_chat_id: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            http,
            bot_token,
            admin_chat_id,
        }
    }

    fn is_configured(&self) -> bool {
        !self.bot_token.is_empty() && !self.admin_chat_id.is_empty()
    }

    pub async fn notify_payment_success(
        &self,
        notification: &PaymentSuccessNotification,
    ) -> Result<(), TelegramError> {
        let text = format!(
            "✅ <b>Payment received</b>\n\n\
             Order: {}\n\
             Billz order: {}\n\
             Amount: {} {}",
            notification.order_number,
            notification.billz_order_id,
            format_price(notification.amount),
            notification.currency,
        );

        self.send_to_admin(&text).await
    }

    pub async fn notify_new_order(
        &self,
        notification: &OrderNotification,
    ) -> Result<(), TelegramError> {
        let mut text = format!(
            "🛒 <b>New order {}</b>\n\n\
             Customer: {}\n\
             Phone: {}\n\
             Payment: {}\n",
            notification.order_number,
            notification.customer_name,
            notification.customer_phone,
            notification.payment_label,
        );

        for item in &notification.items {
            text.push_str(&format!(
                "\n• {} × {} = {}",
                item.name,
                item.quantity,
                format_price(item.price * item.quantity),
            ));
        }

        text.push_str(&format!("\n\nTotal: {}", format_price(notification.total)));

        self.send_to_admin(&text).await
    }

    async fn send_to_admin(&self, text: &str) -> Result<(), TelegramError> {
        if !self.is_configured() {
            tracing::debug!("telegram not configured, dropping notification");
            return Ok(());
        }
        self.send_message(&self.admin_chat_id, text).await
    }

    async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), TelegramError> {
        let url = format!("{API_BASE}/bot{}/sendMessage", self.bot_token);

        let response = self
            .http
            .post(&url)
            .timeout(HTTP_TIMEOUT)
            .json(&json!({
                "chat_id": chat_id,
                "text": text,
                "parse_mode": "HTML",
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TelegramError::Api {
                status: status.as_u16(),
                body,
            });
        }

        Ok(())
    }
}

/// Format a price with space-grouped thousands, rounding to whole units.
fn format_price(amount: f64) -> String {
    let whole = amount.round() as i64;
    let digits = whole.abs().to_string();

    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(' ');
        }
        grouped.push(ch);
    }

    if whole < 0 {
        format!("-{grouped}")
    } else {
        grouped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prices_group_thousands_with_spaces() {
        assert_eq!(format_price(0.0), "0");
        assert_eq!(format_price(950.0), "950");
        assert_eq!(format_price(1500.0), "1 500");
        assert_eq!(format_price(1_250_000.0), "1 250 000");
    }

    #[test]
    fn prices_round_to_whole_units() {
        assert_eq!(format_price(1499.6), "1 500");
        assert_eq!(format_price(-1500.4), "-1 500");
    }

    #[test]
    fn unconfigured_client_drops_messages() {
        let client = TelegramClient::new(String::new(), String::new());
        assert!(!client.is_configured());

        let configured = TelegramClient::new("token".into(), "chat".into());
        assert!(configured.is_configured());
    }
}
