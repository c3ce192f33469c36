//! Worker event loop and mode runtimes.
//!
//! The demux loop waits for INIT, then routes envelopes: REQUESTs go to the
//! mode runtime, RESPONSEs resolve worker-originated sends, SHUTDOWN starts
//! the graceful drain. Sequential mode runs one handler at a time off the
//! priority queue; concurrent mode spawns handlers, optionally behind a
//! bounded pump.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::EnvelopeCodec;
use crate::bridge::protocol::{Envelope, RequestEnvelope, WorkerMode};
use crate::config::DEFAULT_TIMEOUT_MS;
use crate::error::{Error, Result};
use crate::queue::ExpiringQueue;
use crate::stats::now_ms;
use crate::worker::WorkerState;

/// Cadence of the queue expiry sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5);
/// How long the graceful drain waits for in-flight handlers.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
const DRAIN_POLL: Duration = Duration::from_millis(100);

pub(crate) async fn run(
    state: Arc<WorkerState>,
    reader: Box<dyn AsyncRead + Send + Unpin>,
) -> Result<()> {
    let mut frames = FramedRead::new(reader, EnvelopeCodec::new());

    // Nothing runs until the master tells us which mode we are.
    let mode = loop {
        match frames.next().await {
            Some(Ok(Envelope::Init { mode })) => break mode,
            Some(Ok(other)) => {
                tracing::warn!(?other, "envelope before INIT, dropping");
            }
            Some(Err(e)) => {
                return Err(Error::process(format!("channel error before INIT: {}", e)));
            }
            None => {
                tracing::debug!("channel closed before INIT");
                state.disconnect().await;
                return Ok(());
            }
        }
    };
    tracing::info!(%mode, pid = std::process::id(), "worker initialized");

    let heartbeat = spawn_heartbeat(Arc::clone(&state));
    let mode_runtime = ModeRuntime::start(Arc::clone(&state), mode);

    loop {
        match frames.next().await {
            Some(Ok(Envelope::Request(request))) => {
                if state.shutting_down.load(Ordering::SeqCst) {
                    tracing::trace!(id = %request.id, "dropping request during shutdown");
                    continue;
                }
                mode_runtime.submit(request);
            }
            Some(Ok(Envelope::Response(response))) => match state.pending.remove(&response.id) {
                Some((_, tx)) => {
                    let _ = tx.send(response);
                }
                None => {
                    tracing::debug!(id = %response.id, "response with no awaiter, dropping");
                }
            },
            Some(Ok(Envelope::Shutdown)) => {
                tracing::info!("shutdown requested");
                break;
            }
            Some(Ok(other)) => {
                tracing::warn!(?other, "unexpected envelope from master");
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "channel error, shutting down");
                break;
            }
            None => {
                tracing::debug!("channel closed (master gone)");
                break;
            }
        }
    }

    // Graceful drain: refuse new work, let running handlers finish, then
    // discard whatever is still queued and disconnect cleanly.
    state.shutting_down.store(true, Ordering::SeqCst);
    mode_runtime.stop();

    let drain_rounds = DRAIN_TIMEOUT.as_millis() / DRAIN_POLL.as_millis();
    for _ in 0..drain_rounds {
        if state.requests_active.load(Ordering::SeqCst) == 0 {
            break;
        }
        tokio::time::sleep(DRAIN_POLL).await;
    }
    let leftover = state.requests_active.load(Ordering::SeqCst);
    if leftover > 0 {
        tracing::warn!(in_flight = leftover, "drain timed out with handlers still running");
    }

    mode_runtime.clear_queue();
    heartbeat.abort();
    state.disconnect().await;
    tracing::info!("worker exiting");
    Ok(())
}

type SharedQueue = Arc<StdMutex<ExpiringQueue<RequestEnvelope>>>;

enum ModeRuntime {
    /// Sequential and bounded-concurrent: requests park in the priority
    /// queue, a consumer task picks them up.
    Queued {
        queue: SharedQueue,
        notify: Arc<Notify>,
        cancel: CancellationToken,
    },
    /// Handlers dispatched immediately, no backpressure.
    Unbounded { state: Arc<WorkerState> },
}

impl ModeRuntime {
    fn start(state: Arc<WorkerState>, mode: WorkerMode) -> Self {
        let cap = match mode {
            WorkerMode::Sequential => Some(1),
            WorkerMode::Concurrent => state.config.effective_max_concurrency(),
        };
        let Some(cap) = cap else {
            return Self::Unbounded { state };
        };

        let queue: SharedQueue = Arc::new(StdMutex::new(ExpiringQueue::new()));
        let notify = Arc::new(Notify::new());
        let cancel = CancellationToken::new();
        match mode {
            WorkerMode::Sequential => {
                tokio::spawn(run_sequential(
                    state,
                    Arc::clone(&queue),
                    Arc::clone(&notify),
                    cancel.clone(),
                ));
            }
            WorkerMode::Concurrent => {
                tracing::debug!(cap, "bounded concurrent mode");
                tokio::spawn(run_bounded(
                    state,
                    Arc::clone(&queue),
                    Arc::clone(&notify),
                    cancel.clone(),
                    cap,
                ));
            }
        }
        tokio::spawn(run_sweeper(Arc::clone(&queue), cancel.clone()));
        Self::Queued {
            queue,
            notify,
            cancel,
        }
    }

    fn submit(&self, request: RequestEnvelope) {
        match self {
            Self::Queued { queue, notify, .. } => {
                let ttl = Duration::from_millis(request.timeout.unwrap_or(DEFAULT_TIMEOUT_MS));
                queue
                    .lock()
                    .expect("worker queue lock")
                    .enqueue(request, 0, ttl);
                notify.notify_one();
            }
            Self::Unbounded { state } => {
                tokio::spawn(execute(Arc::clone(state), request));
            }
        }
    }

    /// Stop picking up new work. Running handlers are not interrupted.
    fn stop(&self) {
        if let Self::Queued { cancel, .. } = self {
            cancel.cancel();
        }
    }

    fn clear_queue(&self) {
        if let Self::Queued { queue, .. } = self {
            queue.lock().expect("worker queue lock").clear();
        }
    }
}

async fn run_sequential(
    state: Arc<WorkerState>,
    queue: SharedQueue,
    notify: Arc<Notify>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let next = queue.lock().expect("worker queue lock").dequeue();
        match next {
            Some(request) => execute(Arc::clone(&state), request).await,
            None => {
                tokio::select! {
                    _ = notify.notified() => {}
                    _ = cancel.cancelled() => break,
                }
            }
        }
    }
    tracing::debug!("sequential runner stopped");
}

async fn run_bounded(
    state: Arc<WorkerState>,
    queue: SharedQueue,
    notify: Arc<Notify>,
    cancel: CancellationToken,
    cap: usize,
) {
    let in_flight = Arc::new(AtomicUsize::new(0));
    loop {
        if cancel.is_cancelled() {
            break;
        }
        // Launch until the cap is reached or the queue runs dry; re-run on
        // every completion.
        loop {
            if in_flight.load(Ordering::SeqCst) >= cap {
                break;
            }
            let Some(request) = queue.lock().expect("worker queue lock").dequeue() else {
                break;
            };
            in_flight.fetch_add(1, Ordering::SeqCst);
            let state = Arc::clone(&state);
            let in_flight = Arc::clone(&in_flight);
            let notify = Arc::clone(&notify);
            tokio::spawn(async move {
                execute(state, request).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                notify.notify_one();
            });
        }
        tokio::select! {
            _ = notify.notified() => {}
            _ = cancel.cancelled() => break,
        }
    }
    tracing::debug!("bounded pump stopped");
}

async fn run_sweeper(queue: SharedQueue, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.cancelled() => break,
        }
        let dropped = queue.lock().expect("worker queue lock").clean_expired();
        if dropped > 0 {
            tracing::debug!(dropped, "dropped expired queued requests");
        }
    }
}

async fn execute(state: Arc<WorkerState>, request: RequestEnvelope) {
    if state.shutting_down.load(Ordering::SeqCst) {
        tracing::trace!(id = %request.id, "dropping request during shutdown");
        return;
    }
    state.requests_active.fetch_add(1, Ordering::SeqCst);
    let response = state.handlers.dispatch(request).await;
    state.requests_active.fetch_sub(1, Ordering::SeqCst);

    if let Err(e) = state.send_envelope(Envelope::Response(response)).await {
        // The master's timer covers us; it will time the request out.
        tracing::warn!(error = %e, "failed to write response, dropping");
    }
}

fn spawn_heartbeat(state: Arc<WorkerState>) -> JoinHandle<()> {
    let interval = state.config.heartbeat_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let envelope = Envelope::Heartbeat {
                pid: std::process::id(),
                timestamp: now_ms(),
                requests_active: Some(state.requests_active.load(Ordering::SeqCst)),
            };
            if let Err(e) = state.send_envelope(envelope).await {
                // Emit failures are swallowed; the master notices staleness.
                tracing::trace!(error = %e, "heartbeat emit failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{RequestId, ResponseEnvelope};
    use crate::config::WorkerConfig;
    use crate::worker::Worker;
    use futures::SinkExt;
    use serde_json::json;
    use tokio_util::codec::{FramedRead, FramedWrite};

    /// Drive a worker over an in-memory duplex, returning the master-side
    /// framed halves.
    fn harness(
        worker: Worker,
    ) -> (
        FramedWrite<tokio::io::WriteHalf<tokio::io::DuplexStream>, EnvelopeCodec>,
        FramedRead<tokio::io::ReadHalf<tokio::io::DuplexStream>, EnvelopeCodec>,
        JoinHandle<Result<()>>,
    ) {
        let (master_io, worker_io) = tokio::io::duplex(64 * 1024);
        let (worker_read, worker_write) = tokio::io::split(worker_io);
        let join = tokio::spawn(worker.run_with_channel(worker_read, worker_write));

        let (master_read, master_write) = tokio::io::split(master_io);
        (
            FramedWrite::new(master_write, EnvelopeCodec::new()),
            FramedRead::new(master_read, EnvelopeCodec::new()),
            join,
        )
    }

    async fn next_response(
        reader: &mut FramedRead<tokio::io::ReadHalf<tokio::io::DuplexStream>, EnvelopeCodec>,
    ) -> ResponseEnvelope {
        loop {
            match reader.next().await.expect("channel open").expect("frame") {
                Envelope::Response(resp) => return resp,
                Envelope::Heartbeat { .. } => continue,
                other => panic!("unexpected envelope: {:?}", other),
            }
        }
    }

    fn echo_worker() -> Worker {
        let worker = Worker::with_config(WorkerConfig::new().with_heartbeat_interval_ms(60_000));
        worker.register_handler("echo", |data| async move {
            Ok(json!({"echoed": data.unwrap_or(serde_json::Value::Null)}))
        });
        worker
    }

    #[tokio::test]
    async fn sequential_worker_answers_requests() {
        let (mut tx, mut rx, _join) = harness(echo_worker());

        tx.send(Envelope::Init {
            mode: WorkerMode::Sequential,
        })
        .await
        .unwrap();

        let id = RequestId::new();
        tx.send(Envelope::Request(RequestEnvelope {
            id,
            action: "echo".to_string(),
            data: Some(json!({"n": 1})),
            timeout: Some(1_000),
        }))
        .await
        .unwrap();

        let resp = next_response(&mut rx).await;
        assert_eq!(resp.id, id);
        assert_eq!(resp.status, 200);
        assert_eq!(resp.data, Some(json!({"echoed": {"n": 1}})));
    }

    #[tokio::test]
    async fn missing_handler_is_404_with_payload() {
        let (mut tx, mut rx, _join) = harness(echo_worker());

        tx.send(Envelope::Init {
            mode: WorkerMode::Concurrent,
        })
        .await
        .unwrap();
        tx.send(Envelope::Request(RequestEnvelope {
            id: RequestId::new(),
            action: "nonexistent".to_string(),
            data: None,
            timeout: Some(1_000),
        }))
        .await
        .unwrap();

        let resp = next_response(&mut rx).await;
        assert_eq!(resp.status, 404);
        assert_eq!(
            resp.error.as_deref(),
            Some("No handler registered for action: nonexistent")
        );
        assert_eq!(resp.error_payload.unwrap().name, "PeepsyNotFoundError");
    }

    #[tokio::test]
    async fn sequential_runs_one_at_a_time_in_order() {
        let worker = Worker::with_config(WorkerConfig::new().with_heartbeat_interval_ms(60_000));
        worker.register_handler("delay", |data| async move {
            let ms = data
                .as_ref()
                .and_then(|d| d.get("ms"))
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!({"delayed": ms}))
        });

        let (mut tx, mut rx, _join) = harness(worker);
        tx.send(Envelope::Init {
            mode: WorkerMode::Sequential,
        })
        .await
        .unwrap();

        let first = RequestId::new();
        let second = RequestId::new();
        tx.send(Envelope::Request(RequestEnvelope {
            id: first,
            action: "delay".to_string(),
            data: Some(json!({"ms": 80})),
            timeout: Some(5_000),
        }))
        .await
        .unwrap();
        tx.send(Envelope::Request(RequestEnvelope {
            id: second,
            action: "delay".to_string(),
            data: Some(json!({"ms": 0})),
            timeout: Some(5_000),
        }))
        .await
        .unwrap();

        // Despite the second being instant, the first finishes first.
        let resp = next_response(&mut rx).await;
        assert_eq!(resp.id, first);
        let resp = next_response(&mut rx).await;
        assert_eq!(resp.id, second);
    }

    #[tokio::test]
    async fn shutdown_drains_and_closes_the_channel() {
        let (mut tx, mut rx, join) = harness(echo_worker());

        tx.send(Envelope::Init {
            mode: WorkerMode::Sequential,
        })
        .await
        .unwrap();
        tx.send(Envelope::Shutdown).await.unwrap();

        // Worker disconnects: the master side sees EOF.
        loop {
            match rx.next().await {
                None => break,
                Some(Ok(Envelope::Heartbeat { .. })) => continue,
                Some(other) => panic!("unexpected frame during shutdown: {:?}", other),
            }
        }
        let result = join.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn worker_originated_send_resolves_by_id() {
        let worker = echo_worker();
        let handle = worker.handle();
        let (mut tx, mut rx, _join) = harness(worker);

        tx.send(Envelope::Init {
            mode: WorkerMode::Concurrent,
        })
        .await
        .unwrap();

        let send_task = tokio::spawn(async move {
            handle.send("report", Some(json!({"x": 1})), Some(2_000)).await
        });

        // Read the worker's REQUEST off the channel and answer it.
        let request = loop {
            match tx_rx_next(&mut rx).await {
                Envelope::Request(req) => break req,
                Envelope::Heartbeat { .. } => continue,
                other => panic!("unexpected envelope: {:?}", other),
            }
        };
        assert_eq!(request.action, "report");
        tx.send(Envelope::Response(ResponseEnvelope::ok(
            request.id,
            json!({"received": true}),
        )))
        .await
        .unwrap();

        let reply = send_task.await.unwrap().unwrap();
        assert_eq!(reply.status, 200);
        assert_eq!(reply.data, Some(json!({"received": true})));
        assert_eq!(reply.id, request.id);
    }

    async fn tx_rx_next(
        reader: &mut FramedRead<tokio::io::ReadHalf<tokio::io::DuplexStream>, EnvelopeCodec>,
    ) -> Envelope {
        reader.next().await.expect("channel open").expect("frame")
    }

    #[tokio::test]
    async fn bounded_concurrency_respects_the_cap() {
        let worker = Worker::with_config(
            WorkerConfig::new()
                .with_max_concurrency(2)
                .with_heartbeat_interval_ms(60_000),
        );
        let gauge = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (gauge_c, peak_c) = (Arc::clone(&gauge), Arc::clone(&peak));
        worker.register_handler("work", move |_| {
            let gauge = Arc::clone(&gauge_c);
            let peak = Arc::clone(&peak_c);
            async move {
                let now = gauge.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                gauge.fetch_sub(1, Ordering::SeqCst);
                Ok(json!(null))
            }
        });

        let (mut tx, mut rx, _join) = harness(worker);
        tx.send(Envelope::Init {
            mode: WorkerMode::Concurrent,
        })
        .await
        .unwrap();

        for _ in 0..5 {
            tx.send(Envelope::Request(RequestEnvelope {
                id: RequestId::new(),
                action: "work".to_string(),
                data: None,
                timeout: Some(5_000),
            }))
            .await
            .unwrap();
        }
        for _ in 0..5 {
            let resp = next_response(&mut rx).await;
            assert_eq!(resp.status, 200);
        }

        assert!(peak.load(Ordering::SeqCst) <= 2, "cap exceeded");
    }
}
