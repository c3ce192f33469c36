//! Action handler registry.
//!
//! Both endpoints own one: the worker for REQUESTs from the master, the
//! master for REQUESTs originated by workers. Handlers are async functions
//! keyed by action name, registered and removed at runtime.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use futures::future::BoxFuture;

use crate::bridge::protocol::{ErrorPayload, RequestEnvelope, ResponseEnvelope};
use crate::error::ErrorKind;

/// Failure returned by a handler; encoded into a 500 RESPONSE.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self {
            message: err.to_string(),
        }
    }
}

pub type HandlerResult = Result<serde_json::Value, HandlerError>;

type HandlerFn = Arc<dyn Fn(Option<serde_json::Value>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Concurrent map from action name to handler.
pub struct HandlerRegistry {
    handlers: DashMap<String, HandlerFn>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
        }
    }

    /// Register a handler for `action`, replacing any existing one.
    pub fn register<F, Fut>(&self, action: impl Into<String>, handler: F)
    where
        F: Fn(Option<serde_json::Value>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        let wrapped: HandlerFn =
            Arc::new(move |data| -> BoxFuture<'static, HandlerResult> { Box::pin(handler(data)) });
        self.handlers.insert(action.into(), wrapped);
    }

    /// Remove the handler for `action`. Returns whether one was registered.
    pub fn unregister(&self, action: &str) -> bool {
        self.handlers.remove(action).is_some()
    }

    pub fn contains(&self, action: &str) -> bool {
        self.handlers.contains_key(action)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    fn get(&self, action: &str) -> Option<HandlerFn> {
        self.handlers.get(action).map(|h| h.value().clone())
    }

    /// Run the handler for a REQUEST and build the RESPONSE.
    ///
    /// Never escapes a handler failure: missing handlers become 404, handler
    /// errors become 500.
    pub async fn dispatch(&self, request: RequestEnvelope) -> ResponseEnvelope {
        let RequestEnvelope { id, action, data, .. } = request;

        let Some(handler) = self.get(&action) else {
            let message = format!("No handler registered for action: {}", action);
            return ResponseEnvelope::failure(
                id,
                404,
                ErrorPayload::new(ErrorKind::NotFound.name(), message)
                    .with_code(ErrorKind::NotFound.code()),
            );
        };

        let start = Instant::now();
        let result = handler(data).await;
        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok(value) => {
                tracing::debug!(%action, elapsed_ms, "handler completed");
                ResponseEnvelope::ok(id, value)
            }
            Err(err) => {
                tracing::debug!(%action, elapsed_ms, error = %err, "handler failed");
                ResponseEnvelope::failure(id, 500, ErrorPayload::new("Error", err.message))
            }
        }
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
