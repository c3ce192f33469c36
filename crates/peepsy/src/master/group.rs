//! Load-balancing groups.
//!
//! A group is an ordered set of targets sharing a strategy and an optional
//! concurrency cap. Unknown strategies are kept as data and only fail at
//! selection time, so a later `configure_group` can repair the state.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::bridge::protocol::Reply;
use crate::error::{Error, Result};

/// How a group picks the target for the next request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    #[default]
    RoundRobin,
    Random,
    LeastBusy,
    /// An unrecognized strategy name. Accepted at configuration time;
    /// selection fails until it is reconfigured.
    #[serde(untagged)]
    Other(String),
}

impl Strategy {
    pub fn as_str(&self) -> &str {
        match self {
            Self::RoundRobin => "round-robin",
            Self::Random => "random",
            Self::LeastBusy => "least-busy",
            Self::Other(name) => name,
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Strategy {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "round-robin" => Self::RoundRobin,
            "random" => Self::Random,
            "least-busy" => Self::LeastBusy,
            other => Self::Other(other.to_string()),
        })
    }
}

/// Group-level configuration.
#[derive(Debug, Clone, Default)]
pub struct GroupConfig {
    pub strategy: Strategy,
    /// Cap on in-flight requests summed across all targets in the group.
    pub max_concurrency: Option<usize>,
    /// Suppress auto-restart for every member of the group.
    pub disable_auto_restart: bool,
}

impl GroupConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_max_concurrency(mut self, cap: usize) -> Self {
        self.max_concurrency = Some(cap);
        self
    }

    pub fn with_disable_auto_restart(mut self, disable: bool) -> Self {
        self.disable_auto_restart = disable;
        self
    }
}

/// A request parked at the master because its group is at capacity.
pub(crate) struct PendingRequest {
    pub action: String,
    pub data: Option<serde_json::Value>,
    pub timeout: Duration,
    pub enqueued_at: Instant,
    pub tx: oneshot::Sender<Result<Reply>>,
}

/// Master-side group state.
pub(crate) struct Group {
    pub config: GroupConfig,
    pub targets: Vec<String>,
    /// Round-robin position. Persists across membership changes and wraps on
    /// the current length.
    pub cursor: usize,
    pub pending: VecDeque<PendingRequest>,
}

impl Group {
    pub(crate) fn new(config: GroupConfig) -> Self {
        Self {
            config,
            targets: Vec::new(),
            cursor: 0,
            pending: VecDeque::new(),
        }
    }

    pub(crate) fn add_target(&mut self, target: &str) {
        if !self.targets.iter().any(|t| t == target) {
            self.targets.push(target.to_string());
        }
    }

    /// Remove a target. Returns whether the group is now empty (and should be
    /// deleted).
    pub(crate) fn remove_target(&mut self, target: &str) -> bool {
        self.targets.retain(|t| t != target);
        self.targets.is_empty()
    }

    /// Pick the next target given each member's in-flight count (same order
    /// as `targets`).
    pub(crate) fn select(&mut self, loads: &[u32]) -> Result<String> {
        debug_assert_eq!(loads.len(), self.targets.len());
        if self.targets.is_empty() {
            return Err(Error::not_found("group has no targets"));
        }

        let idx = match &self.config.strategy {
            Strategy::RoundRobin => {
                let idx = self.cursor % self.targets.len();
                self.cursor = self.cursor.wrapping_add(1);
                idx
            }
            Strategy::Random => rand::thread_rng().gen_range(0..self.targets.len()),
            Strategy::LeastBusy => {
                // Ties break by earliest list position, so scan with strict <.
                let mut best = 0;
                for (i, load) in loads.iter().enumerate() {
                    if *load < loads[best] {
                        best = i;
                    }
                }
                best
            }
            Strategy::Other(name) => {
                return Err(Error::peepsy(format!(
                    "unknown load-balancing strategy: {}",
                    name
                )));
            }
        };

        Ok(self.targets[idx].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(strategy: Strategy, targets: &[&str]) -> Group {
        let mut g = Group::new(GroupConfig::new().with_strategy(strategy));
        for t in targets {
            g.add_target(t);
        }
        g
    }

    #[test]
    fn round_robin_cycles_in_order() {
        let mut g = group(Strategy::RoundRobin, &["a", "b", "c"]);
        let loads = [0, 0, 0];
        let picks: Vec<String> = (0..6).map(|_| g.select(&loads).unwrap()).collect();
        assert_eq!(picks, ["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn round_robin_cursor_survives_membership_changes() {
        let mut g = group(Strategy::RoundRobin, &["a", "b", "c"]);
        g.select(&[0, 0, 0]).unwrap();
        g.select(&[0, 0, 0]).unwrap();

        g.remove_target("c");
        // Cursor is 2; wraps on the new length of 2.
        assert_eq!(g.select(&[0, 0]).unwrap(), "a");
        assert_eq!(g.select(&[0, 0]).unwrap(), "b");
    }

    #[test]
    fn least_busy_picks_lowest_load() {
        let mut g = group(Strategy::LeastBusy, &["a", "b", "c"]);
        assert_eq!(g.select(&[3, 1, 2]).unwrap(), "b");
    }

    #[test]
    fn least_busy_ties_break_by_position() {
        let mut g = group(Strategy::LeastBusy, &["a", "b", "c"]);
        assert_eq!(g.select(&[1, 1, 1]).unwrap(), "a");
        assert_eq!(g.select(&[2, 1, 1]).unwrap(), "b");
    }

    #[test]
    fn random_stays_in_bounds() {
        let mut g = group(Strategy::Random, &["a", "b"]);
        for _ in 0..50 {
            let pick = g.select(&[0, 0]).unwrap();
            assert!(pick == "a" || pick == "b");
        }
    }

    #[test]
    fn unknown_strategy_fails_only_at_selection() {
        let config = GroupConfig::new().with_strategy(Strategy::Other("fastest".to_string()));
        let mut g = Group::new(config);
        g.add_target("a");

        let err = g.select(&[0]).unwrap_err();
        assert!(err.to_string().contains("fastest"));
    }

    #[test]
    fn strategy_parses_known_and_unknown_names() {
        assert_eq!("round-robin".parse::<Strategy>().unwrap(), Strategy::RoundRobin);
        assert_eq!("least-busy".parse::<Strategy>().unwrap(), Strategy::LeastBusy);
        assert_eq!(
            "mystery".parse::<Strategy>().unwrap(),
            Strategy::Other("mystery".to_string())
        );
    }

    #[test]
    fn strategy_serde_is_kebab_case() {
        assert_eq!(
            serde_json::to_value(Strategy::LeastBusy).unwrap(),
            serde_json::json!("least-busy")
        );
        let parsed: Strategy = serde_json::from_value(serde_json::json!("fastest")).unwrap();
        assert_eq!(parsed, Strategy::Other("fastest".to_string()));
    }

    #[test]
    fn empty_group_selection_is_not_found() {
        let mut g = Group::new(GroupConfig::new());
        let err = g.select(&[]).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn add_target_ignores_duplicates() {
        let mut g = group(Strategy::RoundRobin, &["a"]);
        g.add_target("a");
        assert_eq!(g.targets.len(), 1);
    }

    #[test]
    fn remove_last_target_reports_empty() {
        let mut g = group(Strategy::RoundRobin, &["a", "b"]);
        assert!(!g.remove_target("a"));
        assert!(g.remove_target("b"));
    }
}
