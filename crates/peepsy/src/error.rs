//! Typed error taxonomy.
//!
//! Every failure carries a kind, a stable code, a human-readable message, and
//! the epoch-millisecond timestamp it was created at. The kind-struct shape
//! (rather than one enum variant per field set) keeps the shared fields in one
//! place.

use crate::bridge::protocol::{ErrorPayload, ResponseEnvelope};

/// Classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Generic failure: bad configuration, protocol violation, shutdown races.
    Peepsy,
    /// An awaited response did not arrive within the deadline.
    Timeout,
    /// Spawning, sending to, or killing a worker process failed.
    Process,
    /// A referenced target, group, or handler does not exist.
    NotFound,
}

impl ErrorKind {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Peepsy => "PEEPSY_ERROR",
            Self::Timeout => "PEEPSY_TIMEOUT",
            Self::Process => "PEEPSY_PROCESS",
            Self::NotFound => "PEEPSY_NOT_FOUND",
        }
    }

    /// Error class name, as carried in wire payloads.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Peepsy => "PeepsyError",
            Self::Timeout => "PeepsyTimeoutError",
            Self::Process => "PeepsyProcessError",
            Self::NotFound => "PeepsyNotFoundError",
        }
    }
}

/// A supervisor error.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    timestamp: i64,
}

impl Error {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn peepsy(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Peepsy, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn process(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Process, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Epoch milliseconds at which the error was constructed.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == ErrorKind::Timeout
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }

    /// Structured payload for carrying this error in a RESPONSE envelope.
    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload::new(self.name(), self.message.clone()).with_code(self.code())
    }

    /// The error a caller sees when a RESPONSE comes back with
    /// `status >= 400`. Surfaces `errorPayload.message` when the legacy
    /// string field is absent.
    pub fn from_response(resp: &ResponseEnvelope) -> Self {
        let message = resp
            .error_message()
            .map(str::to_string)
            .unwrap_or_else(|| format!("request failed with status {}", resp.status));
        Self::new(ErrorKind::Peepsy, message)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::RequestId;

    #[test]
    fn codes_and_names_are_stable() {
        assert_eq!(Error::peepsy("x").code(), "PEEPSY_ERROR");
        assert_eq!(Error::timeout("x").code(), "PEEPSY_TIMEOUT");
        assert_eq!(Error::process("x").code(), "PEEPSY_PROCESS");
        assert_eq!(Error::not_found("x").code(), "PEEPSY_NOT_FOUND");
        assert_eq!(Error::not_found("x").name(), "PeepsyNotFoundError");
    }

    #[test]
    fn errors_carry_a_timestamp() {
        let before = chrono::Utc::now().timestamp_millis();
        let err = Error::timeout("late");
        let after = chrono::Utc::now().timestamp_millis();
        assert!(err.timestamp() >= before && err.timestamp() <= after);
    }

    #[test]
    fn from_response_surfaces_payload_message() {
        let resp = ResponseEnvelope {
            id: RequestId::new(),
            status: 500,
            data: None,
            error: None,
            error_payload: Some(ErrorPayload::new("Error", "Test error: from child")),
        };
        let err = Error::from_response(&resp);
        assert!(err.to_string().contains("Test error: from child"));
        assert_eq!(err.kind(), ErrorKind::Peepsy);
    }

    #[test]
    fn from_response_without_details_names_the_status() {
        let resp = ResponseEnvelope {
            id: RequestId::new(),
            status: 503,
            data: None,
            error: None,
            error_payload: None,
        };
        assert!(Error::from_response(&resp).to_string().contains("503"));
    }

    #[test]
    fn to_payload_includes_code() {
        let payload = Error::not_found("no such target").to_payload();
        assert_eq!(payload.name, "PeepsyNotFoundError");
        assert_eq!(payload.code.as_deref(), Some("PEEPSY_NOT_FOUND"));
        assert_eq!(payload.message, "no such target");
    }
}
