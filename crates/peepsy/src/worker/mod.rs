//! Worker endpoint: runs inside the child process.
//!
//! A `Worker` owns the handler registry and the channel back to the master.
//! `run()` drives the event loop on stdin/stdout; `run_with_channel()` runs
//! over any reader/writer pair, which is how in-process workers and tests
//! wire themselves up.

mod runtime;

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio_util::codec::FramedWrite;

use crate::bridge::codec::EnvelopeCodec;
use crate::bridge::protocol::{Envelope, Reply, RequestEnvelope, RequestId, ResponseEnvelope};
use crate::config::{validate_timeout_ms, WorkerConfig, DEFAULT_TIMEOUT_MS};
use crate::error::{Error, Result};
use crate::registry::{HandlerRegistry, HandlerResult};

pub(crate) struct WorkerState {
    pub(crate) config: WorkerConfig,
    pub(crate) handlers: HandlerRegistry,
    writer: tokio::sync::Mutex<Option<FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, EnvelopeCodec>>>,
    pub(crate) pending: DashMap<RequestId, oneshot::Sender<ResponseEnvelope>>,
    pub(crate) requests_active: AtomicU32,
    pub(crate) shutting_down: AtomicBool,
}

impl WorkerState {
    fn new(config: WorkerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            handlers: HandlerRegistry::new(),
            writer: tokio::sync::Mutex::new(None),
            pending: DashMap::new(),
            requests_active: AtomicU32::new(0),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub(crate) async fn send_envelope(&self, envelope: Envelope) -> io::Result<()> {
        let mut guard = self.writer.lock().await;
        match guard.as_mut() {
            Some(writer) => writer.send(envelope).await,
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "channel not connected",
            )),
        }
    }

    pub(crate) async fn disconnect(&self) {
        *self.writer.lock().await = None;
    }
}

/// The worker runtime: register handlers, then run the event loop.
pub struct Worker {
    state: Arc<WorkerState>,
}

impl Worker {
    pub fn new() -> Self {
        Self::with_config(WorkerConfig::new())
    }

    pub fn with_config(config: WorkerConfig) -> Self {
        Self {
            state: WorkerState::new(config),
        }
    }

    /// Register a handler for `action`, replacing any existing one.
    pub fn register_handler<F, Fut>(&self, action: impl Into<String>, handler: F)
    where
        F: Fn(Option<serde_json::Value>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        self.state.handlers.register(action, handler);
    }

    pub fn unregister_handler(&self, action: &str) -> bool {
        self.state.handlers.unregister(action)
    }

    /// A handle for originating requests to the master. Usable once the
    /// event loop is running.
    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            state: Arc::clone(&self.state),
        }
    }

    /// Run the event loop over the process's stdin/stdout.
    pub async fn run(self) -> Result<()> {
        self.run_with_channel(tokio::io::stdin(), tokio::io::stdout())
            .await
    }

    /// Run the event loop over an arbitrary channel.
    pub async fn run_with_channel<R, W>(self, reader: R, writer: W) -> Result<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        {
            let mut guard = self.state.writer.lock().await;
            *guard = Some(FramedWrite::new(
                Box::new(writer) as Box<dyn AsyncWrite + Send + Unpin>,
                EnvelopeCodec::new(),
            ));
        }
        runtime::run(self.state, Box::new(reader)).await
    }
}

impl Default for Worker {
    fn default() -> Self {
        Self::new()
    }
}

/// Clonable handle for worker-originated requests.
///
/// Symmetric to the master's send, minus load balancing: allocate an id,
/// install a resolver, send the REQUEST, and race the response against the
/// timer.
#[derive(Clone)]
pub struct WorkerHandle {
    state: Arc<WorkerState>,
}

impl WorkerHandle {
    pub async fn send(
        &self,
        action: &str,
        data: Option<serde_json::Value>,
        timeout_ms: Option<u64>,
    ) -> Result<Reply> {
        let timeout = match timeout_ms {
            Some(ms) => validate_timeout_ms(ms)?,
            None => Duration::from_millis(DEFAULT_TIMEOUT_MS),
        };
        if self.state.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::peepsy("worker is shutting down"));
        }

        let id = RequestId::new();
        let (tx, mut rx) = oneshot::channel();
        self.state.pending.insert(id, tx);

        let envelope = Envelope::Request(RequestEnvelope {
            id,
            action: action.to_string(),
            data,
            timeout: Some(timeout.as_millis() as u64),
        });
        if let Err(e) = self.state.send_envelope(envelope).await {
            self.state.pending.remove(&id);
            return Err(Error::process(format!(
                "failed to send request to master: {}",
                e
            )));
        }

        tokio::select! {
            biased;

            resolved = &mut rx => match resolved {
                Ok(resp) => finish_reply(resp),
                Err(_) => Err(Error::process("channel closed before response".to_string())),
            },

            _ = tokio::time::sleep(timeout) => {
                match self.state.pending.remove(&id) {
                    Some(_) => Err(Error::timeout(format!(
                        "request to master timed out after {} ms",
                        timeout.as_millis()
                    ))),
                    // The demux loop removed the entry first; take its response.
                    None => match rx.await {
                        Ok(resp) => finish_reply(resp),
                        Err(_) => Err(Error::timeout(format!(
                            "request to master timed out after {} ms",
                            timeout.as_millis()
                        ))),
                    },
                }
            }
        }
    }
}

/// Surface an inbound response to the awaiter, backfilling the legacy
/// `error` field from the structured payload first.
fn finish_reply(mut resp: ResponseEnvelope) -> Result<Reply> {
    resp.normalize_error();
    if resp.is_error() {
        Err(Error::from_response(&resp))
    } else {
        Ok(Reply::from_response(resp))
    }
}
