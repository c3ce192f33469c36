//! Heartbeat monitor and restart trigger.
//!
//! Runs at the heartbeat cadence. A worker whose freshest activity stamp is
//! older than `interval * miss_threshold` is flagged unhealthy and, unless
//! auto-restart is disabled for it, forcibly killed; the exit handler then
//! respawns it with its original configuration.

use std::sync::{Arc, Weak};

use tokio::time::MissedTickBehavior;

use crate::master::events::MasterEvent;
use crate::master::link::WorkerShared;
use crate::master::spawn::ProcessHandle;
use crate::master::MasterInner;
use crate::stats::{now_ms, WorkerStatus};

/// Start the periodic check. Holds only a weak reference so an abandoned
/// master (and its timer) can be dropped without an explicit shutdown.
pub(crate) fn spawn_monitor(inner: &Arc<MasterInner>) {
    let weak: Weak<MasterInner> = Arc::downgrade(inner);
    let interval = inner.config.heartbeat_interval;
    let threshold_ms =
        interval.as_millis() as i64 * i64::from(inner.config.heartbeat_miss_threshold);
    let cancel = inner.monitor_cancel.clone();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it so freshly spawned
        // workers get a full interval before their first check.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let Some(inner) = weak.upgrade() else { break };
            check_workers(&inner, threshold_ms).await;
        }
        tracing::debug!("health monitor stopped");
    });
}

struct WorkerProbe {
    target: String,
    shared: Arc<WorkerShared>,
    handle: Arc<tokio::sync::Mutex<Box<dyn ProcessHandle>>>,
    restart_allowed: bool,
}

async fn check_workers(inner: &Arc<MasterInner>, threshold_ms: i64) {
    // Snapshot under the state lock; act after releasing it.
    let probes: Vec<WorkerProbe> = {
        let state = inner.state.lock().await;
        state
            .workers
            .iter()
            .map(|(target, record)| {
                let group_disables = record
                    .spec
                    .group
                    .as_deref()
                    .and_then(|g| state.groups.get(g))
                    .map(|g| g.config.disable_auto_restart)
                    .unwrap_or(false);
                WorkerProbe {
                    target: target.clone(),
                    shared: Arc::clone(&record.shared),
                    handle: Arc::clone(&record.handle),
                    restart_allowed: !record.spec.options.disable_auto_restart && !group_disables,
                }
            })
            .collect()
    };

    let now = now_ms();
    for probe in probes {
        if probe.shared.has_exited() || probe.shared.is_stopping() {
            continue;
        }
        let staleness = now - probe.shared.with_stats(|s| s.freshest());

        if staleness > threshold_ms {
            // Act only on the healthy->unhealthy transition, so a kill in
            // progress isn't repeated while the exit handler catches up.
            if probe.shared.status() != WorkerStatus::Unhealthy {
                probe.shared.set_status(WorkerStatus::Unhealthy);
                tracing::warn!(
                    target = %probe.target,
                    staleness_ms = staleness,
                    threshold_ms,
                    "worker missed heartbeats"
                );
                inner.events.emit(&MasterEvent::HeartbeatMissed {
                    target: probe.target.clone(),
                    timestamp: now,
                });

                if probe.restart_allowed && !inner.shutting_down.load(std::sync::atomic::Ordering::SeqCst)
                {
                    tracing::warn!(target = %probe.target, "killing unresponsive worker");
                    probe.handle.lock().await.kill();
                }
            }
        } else if matches!(
            probe.shared.status(),
            WorkerStatus::Starting | WorkerStatus::Unhealthy
        ) {
            probe.shared.set_status(WorkerStatus::Healthy);
        }
    }
}
