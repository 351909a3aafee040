//! Operator notifications over the Telegram bot API.
//!
//! Used for orders, circuit-breaker activations, repeated subscribe
//! failures, broker-auth fatals and settlement summaries. Delivery failure
//! is logged and otherwise ignored.

use crate::models::Config;
use std::time::Duration;
use tracing::{debug, warn};

pub struct Notifier {
    client: reqwest::Client,
    bot_token: Option<String>,
    chat_id: Option<String>,
}

impl Notifier {
    pub fn new(config: &Config) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            bot_token: config.telegram_bot_token.clone(),
            chat_id: config.telegram_chat_id.clone(),
        }
    }

    /// A notifier that drops everything; used in tests and headless runs.
    pub fn disabled() -> Self {
        Self {
            client: reqwest::Client::new(),
            bot_token: None,
            chat_id: None,
        }
    }

    pub async fn send(&self, text: &str) {
        let (Some(token), Some(chat_id)) = (&self.bot_token, &self.chat_id) else {
            debug!(text = %text, "notification dropped (not configured)");
            return;
        };

        let url = format!("https://api.telegram.org/bot{token}/sendMessage");
        let body = serde_json::json!({ "chat_id": chat_id, "text": text });
        match self.client.post(&url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!("notification sent");
            }
            Ok(resp) => warn!(status = %resp.status(), "notification rejected"),
            Err(e) => warn!(error = %e, "notification failed"),
        }
    }
}
