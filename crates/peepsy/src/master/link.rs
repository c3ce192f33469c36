//! Per-worker channel state and the master-side reader loop.
//!
//! One link per spawned worker generation: a write half shared behind a
//! mutex (the channel write side is serialized per endpoint) and a reader
//! task that demuxes envelopes until the channel closes, then hands off to
//! exit handling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::EnvelopeCodec;
use crate::bridge::protocol::Envelope;
use crate::master::MasterInner;
use crate::stats::{ProcessStats, WorkerStatus};

pub(crate) type SharedWriter =
    Arc<tokio::sync::Mutex<FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, EnvelopeCodec>>>;

/// Channel-adjacent worker state shared between the dispatcher, the reader
/// loop, the health monitor, and shutdown paths.
pub(crate) struct WorkerShared {
    pub target: String,
    pid: u32,
    pub writer: SharedWriter,
    stats: StdMutex<ProcessStats>,
    status: StdMutex<WorkerStatus>,
    stopping: AtomicBool,
    exit_tx: watch::Sender<bool>,
}

impl WorkerShared {
    pub(crate) fn new(
        target: &str,
        pid: u32,
        writer: Box<dyn AsyncWrite + Send + Unpin>,
    ) -> Arc<Self> {
        let (exit_tx, _) = watch::channel(false);
        Arc::new(Self {
            target: target.to_string(),
            pid,
            writer: Arc::new(tokio::sync::Mutex::new(FramedWrite::new(
                writer,
                EnvelopeCodec::new(),
            ))),
            stats: StdMutex::new(ProcessStats::started_now()),
            status: StdMutex::new(WorkerStatus::Starting),
            stopping: AtomicBool::new(false),
            exit_tx,
        })
    }

    pub(crate) fn pid(&self) -> u32 {
        self.pid
    }

    /// Run `f` against the stats under the lock. Never awaits inside.
    pub(crate) fn with_stats<R>(&self, f: impl FnOnce(&mut ProcessStats) -> R) -> R {
        f(&mut self.stats.lock().expect("worker stats lock"))
    }

    pub(crate) fn stats_snapshot(&self) -> ProcessStats {
        self.stats.lock().expect("worker stats lock").clone()
    }

    pub(crate) fn requests_active(&self) -> u32 {
        self.with_stats(|s| s.requests_active)
    }

    pub(crate) fn inc_active(&self) {
        self.with_stats(|s| {
            s.requests_active += 1;
            s.touch();
        });
    }

    pub(crate) fn dec_active(&self) {
        self.with_stats(|s| s.requests_active = s.requests_active.saturating_sub(1));
    }

    pub(crate) fn status(&self) -> WorkerStatus {
        *self.status.lock().expect("worker status lock")
    }

    pub(crate) fn set_status(&self, status: WorkerStatus) {
        *self.status.lock().expect("worker status lock") = status;
    }

    /// Flag an explicit shutdown so the exit handler skips auto-restart.
    pub(crate) fn set_stopping(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_exited(&self) {
        let _ = self.exit_tx.send(true);
    }

    pub(crate) fn has_exited(&self) -> bool {
        *self.exit_tx.borrow()
    }

    pub(crate) fn exit_rx(&self) -> watch::Receiver<bool> {
        self.exit_tx.subscribe()
    }
}

/// Read envelopes from one worker until its channel closes.
pub(crate) async fn run_link(
    inner: Arc<MasterInner>,
    shared: Arc<WorkerShared>,
    generation: u64,
    reader: Box<dyn AsyncRead + Send + Unpin>,
) {
    let mut frames = FramedRead::new(reader, EnvelopeCodec::new());

    loop {
        match frames.next().await {
            Some(Ok(Envelope::Response(resp))) => {
                inner.handle_response(&shared, resp).await;
            }
            Some(Ok(Envelope::Request(req))) => {
                tracing::debug!(
                    target = %shared.target,
                    id = %req.id,
                    action = %req.action,
                    "request from worker"
                );
                shared.with_stats(|s| s.touch());
                let inner = Arc::clone(&inner);
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    let response = inner.handlers.dispatch(req).await;
                    let mut writer = shared.writer.lock().await;
                    if let Err(e) = writer.send(Envelope::Response(response)).await {
                        // The worker will time out on its side.
                        tracing::warn!(
                            target = %shared.target,
                            error = %e,
                            "failed to write response to worker, dropping"
                        );
                    }
                });
            }
            Some(Ok(Envelope::Heartbeat {
                pid,
                requests_active,
                ..
            })) => {
                tracing::trace!(
                    target = %shared.target,
                    pid,
                    ?requests_active,
                    "heartbeat"
                );
                shared.with_stats(|s| s.record_heartbeat());
            }
            Some(Ok(other)) => {
                tracing::warn!(target = %shared.target, ?other, "unexpected envelope from worker");
            }
            Some(Err(e)) => {
                tracing::error!(target = %shared.target, error = %e, "worker channel error");
                break;
            }
            None => {
                tracing::debug!(target = %shared.target, "worker channel closed");
                break;
            }
        }
    }

    inner.handle_worker_exit(&shared.target, generation).await;
}
