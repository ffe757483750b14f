//! Chat-platform transport — message sending via the Bot API.

use async_trait::async_trait;
use courier_core::config::ChatConfig;
use courier_core::error::{CourierError, Result};
use courier_core::traits::ChatChannel;
use courier_core::types::ChatMessage;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Chat transport over the platform's HTTPS Bot API.
///
/// The underlying client binds to an IPv4 local address so DNS resolution
/// prefers A records (dual-stack hosts in sandboxed networks otherwise stall
/// on unroutable IPv6) and enforces a connect timeout so one unreachable
/// recipient cannot hold up a whole fan-out batch.
pub struct ChatTransport {
    config: ChatConfig,
    client: reqwest::Client,
}

impl ChatTransport {
    pub fn new(config: ChatConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .local_address(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs.max(1)))
            .build()
            .map_err(|e| CourierError::Channel(format!("HTTP client build failed: {e}")))?;
        Ok(Self { config, client })
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{}",
            self.config.api_base.trim_end_matches('/'),
            self.config.bot_token,
            method
        )
    }
}

/// JSON body for one `sendMessage` call.
pub fn build_send_body(chat_id: &str, message: &ChatMessage) -> serde_json::Value {
    let mut body = serde_json::json!({
        "chat_id": chat_id,
        "text": message.text,
        "disable_web_page_preview": true,
    });
    if let Some(mode) = &message.parse_mode {
        body["parse_mode"] = serde_json::Value::String(mode.clone());
    }
    if let Some(action) = &message.action {
        body["reply_markup"] = serde_json::json!({
            "inline_keyboard": [[{"text": action.label, "url": action.url}]],
        });
    }
    body
}

#[derive(Debug, Deserialize)]
struct ChatApiResponse {
    ok: bool,
    description: Option<String>,
}

#[async_trait]
impl ChatChannel for ChatTransport {
    async fn send(&self, chat_id: &str, message: &ChatMessage) -> Result<()> {
        let response = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&build_send_body(chat_id, message))
            .send()
            .await
            .map_err(|e| CourierError::Channel(format!("sendMessage failed: {e}")))?;

        let result: ChatApiResponse = response
            .json()
            .await
            .map_err(|e| CourierError::Channel(format!("Invalid send response: {e}")))?;

        if !result.ok {
            return Err(CourierError::Channel(format!(
                "sendMessage rejected: {}",
                result.description.unwrap_or_default()
            )));
        }
        Ok(())
    }

    fn batch_width(&self) -> usize {
        self.config.batch_width.max(1)
    }
}
