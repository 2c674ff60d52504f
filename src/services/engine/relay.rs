use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{Map, Value};

use super::{unwrap_envelope, EngineAction, EngineError, RelayTransport};

/// Posts actions to the trusted relay. The relay owns the upstream engine
/// credentials; this side only carries the relay bearer token.
pub struct HttpRelay {
    client: Client,
    url: String,
    token: String,
    timeout: Duration,
}

impl HttpRelay {
    pub fn new(client: Client, url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            token: token.into(),
            timeout: Duration::from_secs(20),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

fn request_body(action: EngineAction, params: Value) -> Value {
    let mut body = match params {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("params".to_string(), other);
            map
        }
    };
    body.insert(
        "action".to_string(),
        Value::String(action.as_str().to_string()),
    );
    Value::Object(body)
}

#[async_trait]
impl RelayTransport for HttpRelay {
    async fn invoke(&self, action: EngineAction, params: Value) -> Result<Value, EngineError> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.token)
            .timeout(self.timeout)
            .json(&request_body(action, params))
            .send()
            .await
            .map_err(|err| EngineError::Connection(err.to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(EngineError::Auth(format!(
                "relay responded with status {status}"
            )));
        }

        let text = response
            .text()
            .await
            .map_err(|err| EngineError::Connection(err.to_string()))?;
        let body = match serde_json::from_str::<Value>(&text) {
            Ok(body) => body,
            Err(_) if status.is_server_error() => {
                return Err(EngineError::Connection(format!(
                    "relay responded with status {status}"
                )))
            }
            Err(err) if status.is_success() => {
                return Err(EngineError::InvalidResponse(err.to_string()))
            }
            Err(_) => {
                let message = text.trim();
                return Err(EngineError::action(
                    action,
                    if message.is_empty() {
                        format!("relay responded with status {status}")
                    } else {
                        message.to_string()
                    },
                ));
            }
        };

        match unwrap_envelope(action, body) {
            Err(EngineError::Action { message, .. })
                if matches!(
                    status,
                    StatusCode::BAD_GATEWAY
                        | StatusCode::SERVICE_UNAVAILABLE
                        | StatusCode::GATEWAY_TIMEOUT
                ) =>
            {
                Err(EngineError::Connection(message))
            }
            other => other,
        }
    }
}
