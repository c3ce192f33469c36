//! Master lifecycle events.
//!
//! A small typed observer registry: listeners are plain callbacks, invoked
//! synchronously on the publishing task, never while internal locks are held.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Something notable happened to a worker.
#[derive(Debug, Clone)]
pub enum MasterEvent {
    /// A worker was spawned and registered.
    Spawn { target: String },
    /// A worker-scoped failure that has no request awaiter to surface at.
    Error { target: String, error: String },
    /// A worker exceeded the allowed heartbeat staleness.
    HeartbeatMissed { target: String, timestamp: i64 },
    /// A worker exited and was respawned with its original configuration.
    AutoRestart {
        target: String,
        code: Option<i32>,
        signal: Option<i32>,
    },
}

impl MasterEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Spawn { .. } => "spawn",
            Self::Error { .. } => "error",
            Self::HeartbeatMissed { .. } => "heartbeat-missed",
            Self::AutoRestart { .. } => "auto-restart",
        }
    }

    pub fn target(&self) -> &str {
        match self {
            Self::Spawn { target }
            | Self::Error { target, .. }
            | Self::HeartbeatMissed { target, .. }
            | Self::AutoRestart { target, .. } => target,
        }
    }
}

type Listener = Arc<dyn Fn(&MasterEvent) + Send + Sync>;

/// Token for removing a previously added listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventListenerHandle(u64);

pub(crate) struct EventListeners {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(u64, Listener)>>,
}

impl EventListeners {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn add<F>(&self, listener: F) -> EventListenerHandle
    where
        F: Fn(&MasterEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .expect("event listener lock")
            .push((id, Arc::new(listener)));
        EventListenerHandle(id)
    }

    pub(crate) fn remove(&self, handle: EventListenerHandle) -> bool {
        let mut listeners = self.listeners.lock().expect("event listener lock");
        let before = listeners.len();
        listeners.retain(|(id, _)| *id != handle.0);
        listeners.len() != before
    }

    /// Deliver `event` to every listener. Callbacks run on the caller's task
    /// with the registry lock already released.
    pub(crate) fn emit(&self, event: &MasterEvent) {
        let snapshot: Vec<Listener> = {
            let listeners = self.listeners.lock().expect("event listener lock");
            listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
        };
        tracing::trace!(event = event.name(), target = event.target(), "emitting event");
        for listener in snapshot {
            listener(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn listeners_receive_events() {
        let events = EventListeners::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_clone = Arc::clone(&seen);
        events.add(move |event| {
            seen_clone.lock().unwrap().push(event.name());
        });

        events.emit(&MasterEvent::Spawn {
            target: "w1".to_string(),
        });
        events.emit(&MasterEvent::HeartbeatMissed {
            target: "w1".to_string(),
            timestamp: 0,
        });

        assert_eq!(*seen.lock().unwrap(), vec!["spawn", "heartbeat-missed"]);
    }

    #[test]
    fn removed_listeners_stop_receiving() {
        let events = EventListeners::new();
        let count = Arc::new(AtomicUsize::new(0));

        let count_clone = Arc::clone(&count);
        let handle = events.add(move |_| {
            count_clone.fetch_add(1, Ordering::Relaxed);
        });

        events.emit(&MasterEvent::Spawn {
            target: "w".to_string(),
        });
        assert!(events.remove(handle));
        assert!(!events.remove(handle));
        events.emit(&MasterEvent::Spawn {
            target: "w".to_string(),
        });

        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn event_accessors() {
        let event = MasterEvent::AutoRestart {
            target: "w2".to_string(),
            code: None,
            signal: Some(9),
        };
        assert_eq!(event.name(), "auto-restart");
        assert_eq!(event.target(), "w2");
    }
}
