//! Wire envelopes for master-worker communication.
//!
//! Every message crossing the channel is a tagged record distinguished by
//! `type`. Either endpoint may originate a REQUEST; the RESPONSE travels back
//! with the same correlation id. HEARTBEAT and SHUTDOWN are control-only.

use serde::{Deserialize, Serialize};

// ============================================================================
// RequestId - correlation identifier for request/response pairs
// ============================================================================

/// Correlation identifier for a request/response exchange.
///
/// Uses UUID v4 for guaranteed uniqueness within the originating endpoint's
/// active set. Opaque to the receiving side; it only ever echoes it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(uuid::Uuid);

impl RequestId {
    /// Generate a new unique request ID.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    /// Parse a RequestId from string (UUID format).
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Worker execution mode
// ============================================================================

/// How a worker runs its handlers: one at a time off an ordered queue, or
/// concurrently (optionally bounded by a concurrency cap).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerMode {
    #[default]
    Sequential,
    Concurrent,
}

impl WorkerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Concurrent => "concurrent",
        }
    }
}

impl std::fmt::Display for WorkerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Envelope - the tagged wire record
// ============================================================================

/// A message crossing the master-worker channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Envelope {
    /// First message after spawn: tells the worker which mode to run in.
    #[serde(rename = "INIT")]
    Init { mode: WorkerMode },

    /// A correlated request. Either side may send one.
    #[serde(rename = "REQUEST")]
    Request(RequestEnvelope),

    /// The answer to a REQUEST, matched by id.
    #[serde(rename = "RESPONSE")]
    Response(ResponseEnvelope),

    /// Periodic worker liveness signal.
    #[serde(rename = "HEARTBEAT")]
    Heartbeat {
        pid: u32,
        /// Epoch milliseconds at emission.
        timestamp: i64,
        #[serde(
            rename = "requestsActive",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        requests_active: Option<u32>,
    },

    /// Graceful stop: the worker drains in-flight work and disconnects.
    #[serde(rename = "SHUTDOWN")]
    Shutdown,
}

// ============================================================================
// REQUEST - accepts two shapes on decode, emits one
// ============================================================================

/// A REQUEST envelope body.
///
/// Serializes to the flat form only. Deserialization also accepts the legacy
/// nested form `{request: {id, action, data}, timeout}` so workers stay
/// compatible with masters that still emit it.
#[derive(Debug, Clone, Serialize)]
pub struct RequestEnvelope {
    pub id: RequestId,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Advisory timeout in milliseconds. Authoritative enforcement lives at
    /// the sender; receivers only use it to drop stale queued work.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

#[derive(Deserialize)]
struct NestedRequestBody {
    id: RequestId,
    action: String,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RequestShape {
    // Tried first: only the legacy form carries a `request` key.
    Nested {
        request: NestedRequestBody,
        #[serde(default)]
        timeout: Option<u64>,
    },
    Flat {
        id: RequestId,
        action: String,
        #[serde(default)]
        data: Option<serde_json::Value>,
        #[serde(default)]
        timeout: Option<u64>,
    },
}

impl<'de> Deserialize<'de> for RequestEnvelope {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(match RequestShape::deserialize(deserializer)? {
            RequestShape::Nested { request, timeout } => Self {
                id: request.id,
                action: request.action,
                data: request.data,
                timeout,
            },
            RequestShape::Flat {
                id,
                action,
                data,
                timeout,
            } => Self {
                id,
                action,
                data,
                timeout,
            },
        })
    }
}

// ============================================================================
// RESPONSE
// ============================================================================

/// A RESPONSE envelope body. `status >= 400` means failure, in which case at
/// least one of `error` / `errorPayload` is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: RequestId,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(
        rename = "errorPayload",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub error_payload: Option<ErrorPayload>,
}

impl ResponseEnvelope {
    /// A 200 response carrying the handler's result.
    pub fn ok(id: RequestId, data: serde_json::Value) -> Self {
        Self {
            id,
            status: 200,
            data: Some(data),
            error: None,
            error_payload: None,
        }
    }

    /// An error response (`status >= 400`) with the legacy string field and
    /// the structured payload.
    pub fn failure(id: RequestId, status: u16, payload: ErrorPayload) -> Self {
        Self {
            id,
            status,
            data: None,
            error: Some(payload.message.clone()),
            error_payload: Some(payload),
        }
    }

    pub fn is_error(&self) -> bool {
        self.status >= 400
    }

    /// The human-readable error, preferring the legacy string field and
    /// falling back to the structured payload's message.
    pub fn error_message(&self) -> Option<&str> {
        self.error
            .as_deref()
            .or_else(|| self.error_payload.as_ref().map(|p| p.message.as_str()))
    }

    /// Backfill the legacy `error` field from `errorPayload.message` so
    /// callers see the string field uniformly.
    pub fn normalize_error(&mut self) {
        if self.error.is_none() {
            if let Some(payload) = &self.error_payload {
                self.error = Some(payload.message.clone());
            }
        }
    }
}

/// Structured error details carried alongside the legacy `error` string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorPayload {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            code: None,
            stack: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

// ============================================================================
// Reply - caller-facing view of a successful exchange
// ============================================================================

/// What a `send` resolves to: the response status, its payload, and the
/// correlation id the exchange ran under.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub data: Option<serde_json::Value>,
    pub id: RequestId,
}

impl Reply {
    pub(crate) fn from_response(resp: ResponseEnvelope) -> Self {
        Self {
            status: resp.status,
            data: resp.data,
            id: resp.id,
        }
    }
}
