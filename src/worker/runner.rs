use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("Model not available: {0}")]
    UnsupportedModel(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Execution failed: {0}")]
    Failed(String),
}

/// The inference capability a node exposes. Opaque to the dispatch core.
#[async_trait]
pub trait ModelRunner: Send + Sync {
    async fn execute(&self, model: &str, input: &Value) -> Result<Value, ExecutionError>;
}

/// Stand-in runner that echoes its input after a fixed delay.
///
/// An input object carrying a `"fail"` string fails with that message, which
/// lets demos and tests exercise the failure path.
#[derive(Debug, Clone, Default)]
pub struct EchoRunner {
    latency: Duration,
}

impl EchoRunner {
    pub fn new(latency: Duration) -> Self {
        Self { latency }
    }
}

#[async_trait]
impl ModelRunner for EchoRunner {
    async fn execute(&self, model: &str, input: &Value) -> Result<Value, ExecutionError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if let Some(reason) = input.get("fail").and_then(Value::as_str) {
            return Err(ExecutionError::Failed(reason.to_string()));
        }
        Ok(json!({ "model": model, "echo": input }))
    }
}
