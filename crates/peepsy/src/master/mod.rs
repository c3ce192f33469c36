//! Master: spawns workers, routes requests, enforces group capacity, and
//! supervises health.
//!
//! Flow per request:
//! 1. Resolve the destination (group strategy or direct target).
//! 2. If the group is at its concurrency cap, park the request FIFO.
//! 3. Allocate a correlation id, record it in the active table, send REQUEST.
//! 4. Resolve on RESPONSE, per-request timer expiry, or worker exit —
//!    whichever removes the table entry first owns the outcome.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::SinkExt;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

pub mod events;
pub mod group;
pub(crate) mod health;
pub(crate) mod link;
pub(crate) mod signals;
pub mod spawn;

use crate::bridge::protocol::{Envelope, Reply, RequestEnvelope, RequestId, ResponseEnvelope, WorkerMode};
use crate::config::{validate_timeout_ms, MasterConfig, SpawnOptions, WorkerScript};
use crate::error::{Error, ErrorKind, Result};
use crate::registry::{HandlerRegistry, HandlerResult};
use crate::stats::{ProcessStats, WorkerStatus};

use events::{EventListenerHandle, EventListeners, MasterEvent};
use group::{Group, GroupConfig, PendingRequest, Strategy};
use link::WorkerShared;
use spawn::ProcessHandle;

/// Per-send overrides.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    /// Timeout in milliseconds for each attempt. Defaults to the master's
    /// configured timeout; validated against the same bounds.
    pub timeout: Option<u64>,
    /// Retry count on failure. Defaults to the master's `max_retries`.
    pub retries: Option<u32>,
}

impl SendOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout = Some(ms);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }
}

/// Snapshot of one group member's counters.
#[derive(Debug, Clone, Serialize)]
pub struct GroupTargetStats {
    pub target: String,
    pub status: WorkerStatus,
    pub stats: ProcessStats,
}

/// Aggregate snapshot of a group.
#[derive(Debug, Clone, Serialize)]
pub struct GroupStats {
    pub group_id: String,
    pub strategy: Strategy,
    pub max_concurrency: Option<usize>,
    /// Requests parked behind the concurrency cap.
    pub pending: usize,
    /// In-flight requests summed across members.
    pub requests_active: u32,
    pub targets: Vec<GroupTargetStats>,
}

#[derive(Clone)]
pub(crate) struct SpawnSpec {
    pub script: WorkerScript,
    pub mode: WorkerMode,
    pub group: Option<String>,
    pub options: SpawnOptions,
}

pub(crate) struct WorkerRecord {
    pub spec: SpawnSpec,
    pub shared: Arc<WorkerShared>,
    pub handle: Arc<tokio::sync::Mutex<Box<dyn ProcessHandle>>>,
    pub generation: u64,
}

pub(crate) struct ActiveRequest {
    pub target: String,
    pub group: Option<String>,
    pub started: Instant,
    pub tx: oneshot::Sender<Result<ResponseEnvelope>>,
}

#[derive(Default)]
pub(crate) struct MasterState {
    pub workers: HashMap<String, WorkerRecord>,
    pub groups: HashMap<String, Group>,
}

pub(crate) struct MasterInner {
    pub(crate) config: MasterConfig,
    default_timeout: Duration,
    pub(crate) state: tokio::sync::Mutex<MasterState>,
    pub(crate) active: DashMap<RequestId, ActiveRequest>,
    pub(crate) handlers: HandlerRegistry,
    pub(crate) events: EventListeners,
    pub(crate) shutting_down: AtomicBool,
    next_generation: AtomicU64,
    pub(crate) monitor_cancel: CancellationToken,
}

/// The supervising endpoint. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Master {
    inner: Arc<MasterInner>,
}

impl std::fmt::Debug for Master {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Master").finish_non_exhaustive()
    }
}

impl Master {
    /// Build with default configuration.
    pub fn new() -> Result<Self> {
        Self::with_config(MasterConfig::new())
    }

    /// Build with explicit configuration. Must be called from within a tokio
    /// runtime; fails on an out-of-range timeout.
    pub fn with_config(config: MasterConfig) -> Result<Self> {
        let default_timeout = config.validate()?;
        let inner = Arc::new(MasterInner {
            config,
            default_timeout,
            state: tokio::sync::Mutex::new(MasterState::default()),
            active: DashMap::new(),
            handlers: HandlerRegistry::new(),
            events: EventListeners::new(),
            shutting_down: AtomicBool::new(false),
            next_generation: AtomicU64::new(1),
            monitor_cancel: CancellationToken::new(),
        });
        health::spawn_monitor(&inner);
        signals::register(&inner);
        Ok(Self { inner })
    }

    /// Subscribe to lifecycle events. The callback runs synchronously on the
    /// emitting task.
    pub fn on_event<F>(&self, listener: F) -> EventListenerHandle
    where
        F: Fn(&MasterEvent) + Send + Sync + 'static,
    {
        self.inner.events.add(listener)
    }

    pub fn off_event(&self, handle: EventListenerHandle) -> bool {
        self.inner.events.remove(handle)
    }

    /// Register a master-side handler for worker-originated REQUESTs.
    pub fn register_handler<F, Fut>(&self, action: impl Into<String>, handler: F)
    where
        F: Fn(Option<serde_json::Value>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        self.inner.handlers.register(action, handler);
    }

    pub fn unregister_handler(&self, action: &str) -> bool {
        self.inner.handlers.unregister(action)
    }

    /// Spawn a worker under a unique target name, optionally joining a group.
    pub async fn spawn(
        &self,
        target: &str,
        script: WorkerScript,
        mode: WorkerMode,
        group: Option<&str>,
        options: SpawnOptions,
    ) -> Result<()> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::peepsy("cannot spawn while shutting down"));
        }

        let spec = SpawnSpec {
            script,
            mode,
            group: group.map(str::to_string),
            options,
        };

        let (shared, reader, generation) = {
            let mut state = self.inner.state.lock().await;
            if state.workers.contains_key(target) {
                return Err(Error::peepsy(format!("target already exists: {}", target)));
            }
            self.inner.start_worker_locked(&mut state, target, spec)?
        };

        self.inner
            .finish_start(target, mode, shared, reader, generation)
            .await?;

        self.inner.events.emit(&MasterEvent::Spawn {
            target: target.to_string(),
        });
        Ok(())
    }

    /// Send a request to a target or group and await its reply.
    ///
    /// Retries up to `retries` times with `retry_delay` between attempts;
    /// every attempt gets a fresh id and goes through load balancing again.
    /// Not-found errors are never retried.
    pub async fn send(
        &self,
        action: &str,
        destination: &str,
        data: Option<serde_json::Value>,
        options: SendOptions,
    ) -> Result<Reply> {
        let timeout = match options.timeout {
            Some(ms) => validate_timeout_ms(ms)?,
            None => self.inner.default_timeout,
        };
        let retries = options.retries.unwrap_or(self.inner.config.max_retries);

        let mut attempt = 0u32;
        loop {
            match self
                .inner
                .send_once(action, destination, data.clone(), timeout)
                .await
            {
                Ok(reply) => return Ok(reply),
                Err(e) if e.kind() == ErrorKind::NotFound => return Err(e),
                Err(e) => {
                    if attempt >= retries {
                        return Err(e);
                    }
                    attempt += 1;
                    tracing::debug!(
                        %action,
                        %destination,
                        attempt,
                        error = %e,
                        "send failed, retrying"
                    );
                    tokio::time::sleep(self.inner.config.retry_delay).await;
                }
            }
        }
    }

    /// Create or update a group's configuration. Existing members stay where
    /// they are; an unknown strategy is accepted here and only fails at the
    /// first dispatch.
    pub async fn configure_group(&self, group_id: &str, config: GroupConfig) {
        {
            let mut state = self.inner.state.lock().await;
            match state.groups.get_mut(group_id) {
                Some(group) => group.config = config,
                None => {
                    state
                        .groups
                        .insert(group_id.to_string(), Group::new(config));
                }
            }
        }
        // A raised (or removed) cap may release parked requests.
        self.inner.drain_group(Some(group_id)).await;
    }

    /// Gracefully stop one worker: SHUTDOWN envelope, then a hard kill after
    /// `timeout`. The worker is removed and not restarted.
    pub async fn shutdown_child(&self, target: &str, timeout: Duration) -> Result<()> {
        self.inner.shutdown_child_inner(target, timeout).await
    }

    /// Gracefully stop every worker and refuse further work. Idempotent.
    pub async fn shutdown_all(&self, timeout: Duration) {
        self.inner.shutdown_all_inner(timeout).await;
    }

    /// Counters for one worker, if it exists.
    pub async fn stats(&self, target: &str) -> Option<ProcessStats> {
        let state = self.inner.state.lock().await;
        state.workers.get(target).map(|r| r.shared.stats_snapshot())
    }

    /// Current health label for one worker.
    pub async fn status(&self, target: &str) -> Option<WorkerStatus> {
        let state = self.inner.state.lock().await;
        state.workers.get(target).map(|r| r.shared.status())
    }

    /// The pid of the worker's current process incarnation.
    pub async fn pid(&self, target: &str) -> Option<u32> {
        let state = self.inner.state.lock().await;
        state.workers.get(target).map(|r| r.shared.pid())
    }

    /// Aggregate snapshot for a group.
    pub async fn group_stats(&self, group_id: &str) -> Option<GroupStats> {
        let state = self.inner.state.lock().await;
        let group = state.groups.get(group_id)?;

        let targets: Vec<GroupTargetStats> = group
            .targets
            .iter()
            .filter_map(|t| {
                state.workers.get(t).map(|r| GroupTargetStats {
                    target: t.clone(),
                    status: r.shared.status(),
                    stats: r.shared.stats_snapshot(),
                })
            })
            .collect();
        let requests_active = targets.iter().map(|t| t.stats.requests_active).sum();

        Some(GroupStats {
            group_id: group_id.to_string(),
            strategy: group.config.strategy.clone(),
            max_concurrency: group.config.max_concurrency,
            pending: group.pending.len(),
            requests_active,
            targets,
        })
    }

    /// Targets currently flagged unhealthy by the heartbeat monitor.
    pub async fn unhealthy_targets(&self) -> Vec<String> {
        let state = self.inner.state.lock().await;
        state
            .workers
            .iter()
            .filter(|(_, r)| r.shared.status() == WorkerStatus::Unhealthy)
            .map(|(t, _)| t.clone())
            .collect()
    }

    /// Requests awaiting a response across all workers.
    pub fn active_count(&self) -> usize {
        self.inner.active.len()
    }

    /// Whether a target exists and its channel is still up.
    pub async fn alive(&self, target: &str) -> bool {
        let state = self.inner.state.lock().await;
        state
            .workers
            .get(target)
            .map(|r| !r.shared.has_exited())
            .unwrap_or(false)
    }
}

enum DrainStep {
    Skip,
    Dispatch(PendingRequest, Arc<WorkerShared>),
}

impl MasterInner {
    /// Spawn the process and install the record; caller finishes the
    /// handshake outside the lock.
    fn start_worker_locked(
        self: &Arc<Self>,
        state: &mut MasterState,
        target: &str,
        spec: SpawnSpec,
    ) -> Result<(Arc<WorkerShared>, Box<dyn AsyncRead + Send + Unpin>, u64)> {
        let spawned = self
            .config
            .spawner
            .spawn(target, &spec.script, &spec.options)?;
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let shared = WorkerShared::new(target, spawned.pid, spawned.writer);

        if let Some(group_id) = &spec.group {
            state
                .groups
                .entry(group_id.clone())
                .or_insert_with(|| Group::new(GroupConfig::default()))
                .add_target(target);
        }
        state.workers.insert(
            target.to_string(),
            WorkerRecord {
                spec,
                shared: Arc::clone(&shared),
                handle: Arc::new(tokio::sync::Mutex::new(spawned.handle)),
                generation,
            },
        );

        Ok((shared, spawned.reader, generation))
    }

    /// Send INIT and start the reader loop for a freshly spawned worker.
    fn finish_start<'a>(
        self: &'a Arc<Self>,
        target: &'a str,
        mode: WorkerMode,
        shared: Arc<WorkerShared>,
        reader: Box<dyn AsyncRead + Send + Unpin>,
        generation: u64,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
        let init_result = {
            let mut writer = shared.writer.lock().await;
            writer.send(Envelope::Init { mode }).await
        };
        if let Err(e) = init_result {
            self.remove_worker_generation(target, generation).await;
            return Err(Error::process(format!(
                "failed to initialize worker {}: {}",
                target, e
            )));
        }

        tokio::spawn(link::run_link(
            Arc::clone(self),
            shared,
            generation,
            reader,
        ));
        Ok(())
        })
    }

    async fn send_once(
        self: &Arc<Self>,
        action: &str,
        destination: &str,
        data: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<Reply> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::peepsy("master is shutting down"));
        }

        enum Route {
            Direct(Arc<WorkerShared>, Option<String>),
            Queued(oneshot::Receiver<Result<Reply>>),
        }

        let route = {
            let mut state = self.state.lock().await;
            let state = &mut *state;
            if let Some(group) = state.groups.get(destination) {
                let loads: Vec<u32> = group
                    .targets
                    .iter()
                    .map(|t| {
                        state
                            .workers
                            .get(t)
                            .map(|r| r.shared.requests_active())
                            .unwrap_or(0)
                    })
                    .collect();
                let in_flight: u32 = loads.iter().sum();
                let at_capacity = group
                    .config
                    .max_concurrency
                    .is_some_and(|cap| in_flight as usize >= cap);

                let group = state
                    .groups
                    .get_mut(destination)
                    .expect("group checked above");
                if at_capacity {
                    tracing::debug!(
                        group = destination,
                        %action,
                        in_flight,
                        "group at capacity, queueing request"
                    );
                    let (tx, rx) = oneshot::channel();
                    group.pending.push_back(PendingRequest {
                        action: action.to_string(),
                        data: data.clone(),
                        timeout,
                        enqueued_at: Instant::now(),
                        tx,
                    });
                    Route::Queued(rx)
                } else {
                    let target = group.select(&loads)?;
                    let shared = state
                        .workers
                        .get(&target)
                        .ok_or_else(|| {
                            Error::process(format!("group member {} has no record", target))
                        })?
                        .shared
                        .clone();
                    shared.inc_active();
                    Route::Direct(shared, Some(destination.to_string()))
                }
            } else if let Some(record) = state.workers.get(destination) {
                let shared = Arc::clone(&record.shared);
                shared.inc_active();
                Route::Direct(shared, record.spec.group.clone())
            } else {
                return Err(Error::not_found(format!(
                    "unknown target or group: {}",
                    destination
                )));
            }
        };

        match route {
            Route::Direct(shared, group) => {
                self.dispatch(action.to_string(), data, timeout, shared, group)
                    .await
            }
            Route::Queued(rx) => rx
                .await
                .map_err(|_| Error::peepsy("master shut down before queued request was dispatched"))?,
        }
    }

    /// The in-flight counter for this target is already incremented; send
    /// the REQUEST and await whichever of response / timer / exit resolves
    /// the table entry first.
    fn dispatch(
        self: &Arc<Self>,
        action: String,
        data: Option<serde_json::Value>,
        timeout: Duration,
        shared: Arc<WorkerShared>,
        group: Option<String>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Reply>> + Send + '_>> {
        Box::pin(async move {
        let id = RequestId::new();
        let (tx, mut rx) = oneshot::channel();
        self.active.insert(
            id,
            ActiveRequest {
                target: shared.target.clone(),
                group: group.clone(),
                started: Instant::now(),
                tx,
            },
        );
        tracing::debug!(
            %id,
            %action,
            target = %shared.target,
            timeout_ms = timeout.as_millis() as u64,
            "sending request"
        );

        let envelope = Envelope::Request(RequestEnvelope {
            id,
            action,
            data,
            timeout: Some(timeout.as_millis() as u64),
        });
        let write_result = {
            let mut writer = shared.writer.lock().await;
            writer.send(envelope).await
        };
        if let Err(e) = write_result {
            if self.active.remove(&id).is_some() {
                shared.dec_active();
                shared.with_stats(|s| s.errors += 1);
            }
            self.drain_group(group.as_deref()).await;
            return Err(Error::process(format!(
                "failed to send request to {}: {}",
                shared.target, e
            )));
        }

        tokio::select! {
            biased;

            resolved = &mut rx => match resolved {
                Ok(Ok(resp)) if resp.is_error() => Err(Error::from_response(&resp)),
                Ok(Ok(resp)) => Ok(Reply::from_response(resp)),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(Error::process(format!(
                    "request to {} was dropped",
                    shared.target
                ))),
            },

            _ = tokio::time::sleep(timeout) => {
                match self.active.remove(&id) {
                    Some(_) => {
                        shared.dec_active();
                        shared.with_stats(|s| s.errors += 1);
                        self.drain_group(group.as_deref()).await;
                        // The request may still be running worker-side; its
                        // eventual response finds no table entry and is dropped.
                        Err(Error::timeout(format!(
                            "request to {} timed out after {} ms",
                            shared.target,
                            timeout.as_millis()
                        )))
                    }
                    None => {
                        // A response or exit removed the entry first; take its outcome.
                        match rx.await {
                            Ok(Ok(resp)) if resp.is_error() => Err(Error::from_response(&resp)),
                            Ok(Ok(resp)) => Ok(Reply::from_response(resp)),
                            Ok(Err(e)) => Err(e),
                            Err(_) => Err(Error::timeout(format!(
                                "request to {} timed out after {} ms",
                                shared.target,
                                timeout.as_millis()
                            ))),
                        }
                    }
                }
            }
        }
        })
    }

    /// Route an inbound RESPONSE to its awaiter. A response with no matching
    /// entry (already timed out) is dropped without side effects.
    pub(crate) async fn handle_response(
        self: &Arc<Self>,
        shared: &Arc<WorkerShared>,
        resp: ResponseEnvelope,
    ) {
        let Some((_, entry)) = self.active.remove(&resp.id) else {
            tracing::debug!(id = %resp.id, "response with no matching active request, dropping");
            return;
        };

        let elapsed_ms = entry.started.elapsed().as_secs_f64() * 1000.0;
        shared.with_stats(|s| {
            s.requests_active = s.requests_active.saturating_sub(1);
            s.requests_handled += 1;
            s.observe_response_time(elapsed_ms);
            if resp.status >= 400 {
                s.errors += 1;
            }
            s.touch();
        });
        tracing::debug!(
            id = %resp.id,
            target = %shared.target,
            status = resp.status,
            elapsed_ms,
            "response received"
        );

        let _ = entry.tx.send(Ok(resp));
        self.drain_group(entry.group.as_deref()).await;
    }

    /// Dispatch queued group requests while capacity is available. Each one
    /// re-routes through the strategy, so a slot freed on one target may run
    /// a queued job on another.
    pub(crate) async fn drain_group(self: &Arc<Self>, group_id: Option<&str>) {
        let Some(gid) = group_id else { return };
        loop {
            let step = {
                let mut state = self.state.lock().await;
                let state = &mut *state;
                let Some(group) = state.groups.get(gid) else {
                    return;
                };
                if group.pending.is_empty() {
                    return;
                }

                let loads: Vec<u32> = group
                    .targets
                    .iter()
                    .map(|t| {
                        state
                            .workers
                            .get(t)
                            .map(|r| r.shared.requests_active())
                            .unwrap_or(0)
                    })
                    .collect();
                let in_flight: u32 = loads.iter().sum();
                if group
                    .config
                    .max_concurrency
                    .is_some_and(|cap| in_flight as usize >= cap)
                {
                    return;
                }

                let group = state.groups.get_mut(gid).expect("group checked above");
                let pending = group.pending.pop_front().expect("pending checked above");
                if self.shutting_down.load(Ordering::SeqCst) {
                    let _ = pending.tx.send(Err(Error::peepsy("master is shutting down")));
                    DrainStep::Skip
                } else {
                    match group.select(&loads) {
                        Ok(target) => match state.workers.get(&target) {
                            Some(record) => {
                                let shared = Arc::clone(&record.shared);
                                shared.inc_active();
                                DrainStep::Dispatch(pending, shared)
                            }
                            None => {
                                let _ = pending.tx.send(Err(Error::process(format!(
                                    "group member {} has no record",
                                    target
                                ))));
                                DrainStep::Skip
                            }
                        },
                        Err(e) => {
                            let _ = pending.tx.send(Err(e));
                            DrainStep::Skip
                        }
                    }
                }
            };

            match step {
                DrainStep::Skip => continue,
                DrainStep::Dispatch(pending, shared) => {
                    tracing::debug!(
                        group = gid,
                        action = %pending.action,
                        target = %shared.target,
                        queued_ms = pending.enqueued_at.elapsed().as_millis() as u64,
                        "dispatching queued request"
                    );
                    let inner = Arc::clone(self);
                    let gid = gid.to_string();
                    tokio::spawn(async move {
                        let result = inner
                            .dispatch(
                                pending.action,
                                pending.data,
                                pending.timeout,
                                shared,
                                Some(gid),
                            )
                            .await;
                        let _ = pending.tx.send(result);
                    });
                }
            }
        }
    }

    /// Called by the link loop when a worker's channel closes: collect the
    /// exit status, reject its in-flight requests, and restart or remove it.
    pub(crate) async fn handle_worker_exit(self: &Arc<Self>, target: &str, generation: u64) {
        let (spec, shared, handle) = {
            let state = self.state.lock().await;
            match state.workers.get(target) {
                Some(record) if record.generation == generation => (
                    record.spec.clone(),
                    Arc::clone(&record.shared),
                    Arc::clone(&record.handle),
                ),
                // A newer generation already replaced this record.
                _ => return,
            }
        };

        let exit = {
            let mut handle = handle.lock().await;
            handle.wait().await
        };
        shared.mark_exited();
        tracing::info!(
            %target,
            code = ?exit.code,
            signal = ?exit.signal,
            "worker exited"
        );

        // Reject everything still in flight to this target.
        let stale: Vec<RequestId> = self
            .active
            .iter()
            .filter(|entry| entry.value().target == target)
            .map(|entry| *entry.key())
            .collect();
        let mut affected_groups: HashSet<String> = HashSet::new();
        for id in stale {
            if let Some((_, entry)) = self.active.remove(&id) {
                shared.with_stats(|s| {
                    s.requests_active = s.requests_active.saturating_sub(1);
                    s.errors += 1;
                });
                if let Some(g) = &entry.group {
                    affected_groups.insert(g.clone());
                }
                let _ = entry.tx.send(Err(Error::process(format!(
                    "worker {} exited before responding",
                    target
                ))));
            }
        }

        let group_disables = {
            let state = self.state.lock().await;
            spec.group
                .as_deref()
                .and_then(|g| state.groups.get(g))
                .map(|g| g.config.disable_auto_restart)
                .unwrap_or(false)
        };
        let restart = !self.shutting_down.load(Ordering::SeqCst)
            && !shared.is_stopping()
            && !spec.options.disable_auto_restart
            && !group_disables;

        if restart {
            shared.set_status(WorkerStatus::Restarting);
            let mode = spec.mode;
            let start = {
                let mut state = self.state.lock().await;
                self.start_worker_locked(&mut state, target, spec)
            };
            let restarted = match start {
                Ok((new_shared, reader, new_generation)) => {
                    self.finish_start(target, mode, new_shared, reader, new_generation)
                        .await
                }
                Err(e) => Err(e),
            };
            match restarted {
                Ok(()) => {
                    tracing::info!(%target, "worker restarted");
                    self.events.emit(&MasterEvent::AutoRestart {
                        target: target.to_string(),
                        code: exit.code,
                        signal: exit.signal,
                    });
                }
                Err(e) => {
                    // No implicit retry; the target stays gone until the next
                    // explicit spawn.
                    tracing::error!(%target, error = %e, "failed to restart worker");
                    self.remove_worker_generation(target, generation).await;
                    self.events.emit(&MasterEvent::Error {
                        target: target.to_string(),
                        error: e.to_string(),
                    });
                }
            }
        } else {
            shared.set_status(WorkerStatus::Gone);
            self.remove_worker_generation(target, generation).await;
        }

        for group in affected_groups {
            self.drain_group(Some(&group)).await;
        }
    }

    /// Remove a worker record (and its group membership) if it still belongs
    /// to the given generation.
    async fn remove_worker_generation(&self, target: &str, generation: u64) {
        let mut state = self.state.lock().await;
        let belongs = state
            .workers
            .get(target)
            .map(|r| r.generation == generation)
            .unwrap_or(false);
        if !belongs {
            return;
        }
        let record = state.workers.remove(target).expect("record checked above");
        if let Some(group_id) = &record.spec.group {
            if let Some(group) = state.groups.get_mut(group_id) {
                if group.remove_target(target) {
                    // Reject whatever is still parked before deleting the group.
                    if let Some(mut group) = state.groups.remove(group_id) {
                        for pending in group.pending.drain(..) {
                            let _ = pending.tx.send(Err(Error::not_found(format!(
                                "group {} no longer has any targets",
                                group_id
                            ))));
                        }
                    }
                }
            }
        }
    }

    pub(crate) async fn shutdown_child_inner(
        self: &Arc<Self>,
        target: &str,
        timeout: Duration,
    ) -> Result<()> {
        let (shared, handle) = {
            let state = self.state.lock().await;
            let record = state
                .workers
                .get(target)
                .ok_or_else(|| Error::not_found(format!("unknown target: {}", target)))?;
            (Arc::clone(&record.shared), Arc::clone(&record.handle))
        };

        shared.set_stopping();
        let mut exit_rx = shared.exit_rx();

        tracing::debug!(%target, timeout_ms = timeout.as_millis() as u64, "shutting down worker");
        {
            let mut writer = shared.writer.lock().await;
            if let Err(e) = writer.send(Envelope::Shutdown).await {
                tracing::debug!(%target, error = %e, "shutdown envelope not delivered (channel down)");
            }
        }

        let timed_out = {
            let graceful = tokio::time::timeout(timeout, exit_rx.wait_for(|exited| *exited)).await;
            graceful.is_err()
        };
        if timed_out {
            tracing::warn!(%target, "graceful shutdown timed out, killing worker");
            handle.lock().await.kill();
            let mut exit_rx = shared.exit_rx();
            let _ = tokio::time::timeout(
                Duration::from_secs(5),
                exit_rx.wait_for(|exited| *exited),
            )
            .await;
        }
        Ok(())
    }

    pub(crate) async fn shutdown_all_inner(self: &Arc<Self>, timeout: Duration) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.monitor_cancel.cancel();
        tracing::info!("shutting down all workers");

        let targets: Vec<String> = {
            let mut state = self.state.lock().await;
            for group in state.groups.values_mut() {
                for pending in group.pending.drain(..) {
                    let _ = pending.tx.send(Err(Error::peepsy("master is shutting down")));
                }
            }
            state.workers.keys().cloned().collect()
        };

        let shutdowns = targets
            .iter()
            .map(|target| self.shutdown_child_inner(target, timeout));
        futures::future::join_all(shutdowns).await;

        // Anything still in the table belongs to workers that never answered.
        let leftover: Vec<RequestId> = self.active.iter().map(|e| *e.key()).collect();
        for id in leftover {
            if let Some((_, entry)) = self.active.remove(&id) {
                let _ = entry
                    .tx
                    .send(Err(Error::process("master shut down".to_string())));
            }
        }

        let mut state = self.state.lock().await;
        state.workers.clear();
        state.groups.clear();
        tracing::info!("shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn construction_rejects_bad_timeout() {
        let err = Master::with_config(MasterConfig::new().with_timeout_ms(0)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Peepsy);

        let err = Master::with_config(MasterConfig::new().with_timeout_ms(300_001)).unwrap_err();
        assert!(err.to_string().contains("timeout"));
    }

    #[tokio::test]
    async fn send_to_unknown_destination_is_not_found() {
        let master = Master::new().unwrap();
        let err = master
            .send("echo", "ghost", None, SendOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn per_send_timeout_is_validated() {
        let master = Master::new().unwrap();
        let err = master
            .send(
                "echo",
                "ghost",
                None,
                SendOptions::new().with_timeout_ms(0),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Peepsy);
    }

    #[tokio::test]
    async fn configure_group_accepts_unknown_strategy() {
        let master = Master::new().unwrap();
        master
            .configure_group(
                "g",
                GroupConfig::new().with_strategy(Strategy::Other("fastest".to_string())),
            )
            .await;

        let stats = master.group_stats("g").await.unwrap();
        assert_eq!(stats.strategy, Strategy::Other("fastest".to_string()));
    }

    #[tokio::test]
    async fn group_resolution_beats_target_resolution() {
        // Sending to an empty configured group is a routing miss, not a
        // target miss.
        let master = Master::new().unwrap();
        master.configure_group("pool", GroupConfig::new()).await;
        let err = master
            .send("echo", "pool", None, SendOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("no targets"));
    }

    #[tokio::test]
    async fn event_listener_round_trip() {
        let master = Master::new().unwrap();
        let handle = master.on_event(|_| {});
        assert!(master.off_event(handle));
        assert!(!master.off_event(handle));
    }
}
