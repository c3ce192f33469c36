//! peepsy: bidirectional request/response IPC supervisor for worker pools.
//!
//! A master process spawns long-lived worker processes, routes requests to
//! them directly or through load-balancing groups, enforces group-level
//! concurrency caps, and supervises health via heartbeats with automatic
//! restart. Every exchange crosses the channel as an HTTP-like envelope
//! (status codes, error payload, correlation id), and either side may
//! originate a request.

mod config;
mod error;
mod queue;
mod registry;
mod stats;

pub mod bridge;
pub mod master;
pub mod worker;

pub use bridge::protocol::{
    Envelope, ErrorPayload, Reply, RequestEnvelope, RequestId, ResponseEnvelope, WorkerMode,
};
pub use config::{
    validate_timeout_ms, MasterConfig, SpawnOptions, WorkerConfig, WorkerScript,
    DEFAULT_TIMEOUT_MS, MAX_CONCURRENCY_ENV, MAX_TIMEOUT_MS,
};
pub use error::{Error, ErrorKind, Result};
pub use master::events::{EventListenerHandle, MasterEvent};
pub use master::group::{GroupConfig, Strategy};
pub use master::spawn::{ExitInfo, ProcessHandle, ProcessSpawner, SpawnedWorker, WorkerSpawner};
pub use master::{GroupStats, GroupTargetStats, Master, SendOptions};
pub use queue::ExpiringQueue;
pub use registry::{HandlerError, HandlerRegistry, HandlerResult};
pub use stats::{ProcessStats, WorkerStatus};
pub use worker::{Worker, WorkerHandle};
