//! Per-worker statistics and health status.

use serde::Serialize;

/// Smoothing factor for the response-time moving average. The first sample
/// seeds the average; subsequent samples blend in at this weight.
pub(crate) const EMA_ALPHA: f64 = 0.2;

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Liveness label derived from heartbeat recency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    #[default]
    Starting,
    Healthy,
    Unhealthy,
    Restarting,
    Gone,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Restarting => "restarting",
            Self::Gone => "gone",
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters the master keeps per worker.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessStats {
    pub requests_handled: u64,
    pub requests_active: u32,
    /// Exponential moving average of response times, in milliseconds.
    pub avg_response_time: f64,
    pub errors: u64,
    /// Epoch ms of the last observed activity (send, response, heartbeat).
    pub last_activity: i64,
    /// Epoch ms of the last HEARTBEAT envelope.
    pub last_heartbeat_at: i64,
}

impl ProcessStats {
    /// Stats for a freshly spawned worker: activity starts now so the health
    /// monitor doesn't flag it before its first heartbeat.
    pub(crate) fn started_now() -> Self {
        Self {
            last_activity: now_ms(),
            ..Self::default()
        }
    }

    /// Fold a completed-response duration into the moving average.
    pub(crate) fn observe_response_time(&mut self, sample_ms: f64) {
        if self.avg_response_time == 0.0 {
            self.avg_response_time = sample_ms;
        } else {
            self.avg_response_time =
                EMA_ALPHA * sample_ms + (1.0 - EMA_ALPHA) * self.avg_response_time;
        }
    }

    pub(crate) fn touch(&mut self) {
        self.last_activity = now_ms();
    }

    pub(crate) fn record_heartbeat(&mut self) {
        let now = now_ms();
        self.last_heartbeat_at = now;
        self.last_activity = now;
    }

    /// The most recent of heartbeat and activity, for staleness checks.
    pub(crate) fn freshest(&self) -> i64 {
        self.last_heartbeat_at.max(self.last_activity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_seeds_the_average() {
        let mut stats = ProcessStats::default();
        stats.observe_response_time(100.0);
        assert_eq!(stats.avg_response_time, 100.0);
    }

    #[test]
    fn subsequent_samples_blend_at_alpha() {
        let mut stats = ProcessStats::default();
        stats.observe_response_time(100.0);
        stats.observe_response_time(200.0);
        // 0.2 * 200 + 0.8 * 100
        assert!((stats.avg_response_time - 120.0).abs() < f64::EPSILON);
    }

    #[test]
    fn started_now_is_fresh() {
        let stats = ProcessStats::started_now();
        assert!(now_ms() - stats.freshest() < 1_000);
        assert_eq!(stats.requests_active, 0);
    }

    #[test]
    fn heartbeat_advances_both_stamps() {
        let mut stats = ProcessStats::default();
        stats.record_heartbeat();
        assert!(stats.last_heartbeat_at > 0);
        assert_eq!(stats.last_heartbeat_at, stats.last_activity);
    }

    #[test]
    fn status_labels() {
        assert_eq!(WorkerStatus::Healthy.as_str(), "healthy");
        assert_eq!(WorkerStatus::default(), WorkerStatus::Starting);
    }
}
