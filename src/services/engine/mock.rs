use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::{unwrap_envelope, EngineAction, EngineError, RelayTransport};

type Handler = dyn Fn(EngineAction, &Value) -> Result<Value, EngineError> + Send + Sync;
type DelayFn = dyn Fn(EngineAction, &Value) -> Duration + Send + Sync;

/// Scripted relay. The handler returns the relay's response body, which is
/// then unwrapped exactly like a real response.
#[derive(Clone)]
pub struct MockRelay {
    handler: Arc<Handler>,
    delay: Option<Arc<DelayFn>>,
    calls: Arc<Mutex<Vec<(EngineAction, Value)>>>,
}

impl MockRelay {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(EngineAction, &Value) -> Result<Value, EngineError> + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
            delay: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_delay<F>(mut self, delay: F) -> Self
    where
        F: Fn(EngineAction, &Value) -> Duration + Send + Sync + 'static,
    {
        self.delay = Some(Arc::new(delay));
        self
    }

    pub fn calls(&self) -> Vec<(EngineAction, Value)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, action: EngineAction) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(a, _)| *a == action)
            .count()
    }
}

#[async_trait]
impl RelayTransport for MockRelay {
    async fn invoke(&self, action: EngineAction, params: Value) -> Result<Value, EngineError> {
        self.calls.lock().unwrap().push((action, params.clone()));
        if let Some(delay) = &self.delay {
            tokio::time::sleep(delay(action, &params)).await;
        }
        let body = (self.handler)(action, &params)?;
        unwrap_envelope(action, body)
    }
}
