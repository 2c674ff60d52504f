//! Outbound control commands delivered to a product's own webhook endpoint.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Signature-256";
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WebhookCommand {
    Start,
    Stop,
    Restart,
    Status,
}

impl WebhookCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookCommand::Start => "start",
            WebhookCommand::Stop => "stop",
            WebhookCommand::Restart => "restart",
            WebhookCommand::Status => "status",
        }
    }
}

impl fmt::Display for WebhookCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("webhook url is invalid: {0}")]
    InvalidUrl(String),
    #[error("webhook delivery failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("webhook payload could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("webhook endpoint responded with status {0}")]
    Status(StatusCode),
}

#[derive(Debug, Serialize)]
pub struct WebhookEnvelope<'a> {
    pub event: &'a str,
    pub timestamp: DateTime<Utc>,
    pub product_id: Uuid,
    pub data: &'a Value,
}

/// `sha256=<hex>` over the exact request body.
pub fn sign_payload(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Delivers one command. Only HTTP-level success is checked; the response
/// body is ignored.
pub async fn send_command(
    client: &Client,
    url: &str,
    signing_secret: Option<&str>,
    product_id: Uuid,
    command: WebhookCommand,
    data: &Value,
) -> Result<StatusCode, WebhookError> {
    let parsed =
        reqwest::Url::parse(url.trim()).map_err(|err| WebhookError::InvalidUrl(err.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(WebhookError::InvalidUrl(format!(
            "unsupported scheme {}",
            parsed.scheme()
        )));
    }

    let envelope = WebhookEnvelope {
        event: command.as_str(),
        timestamp: Utc::now(),
        product_id,
        data,
    };
    let body = serde_json::to_vec(&envelope)?;

    let mut request = client
        .post(parsed)
        .timeout(WEBHOOK_TIMEOUT)
        .header(reqwest::header::CONTENT_TYPE, "application/json");
    if let Some(secret) = signing_secret.filter(|s| !s.is_empty()) {
        request = request.header(SIGNATURE_HEADER, sign_payload(secret, &body));
    }

    let response = request.body(body).send().await?;
    let status = response.status();
    if !status.is_success() {
        warn!(%product_id, %command, %status, "webhook command rejected");
        return Err(WebhookError::Status(status));
    }
    info!(%product_id, %command, %status, "webhook command delivered");
    Ok(status)
}
