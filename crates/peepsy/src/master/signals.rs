//! Process-level signal bridge.
//!
//! SIGINT/SIGTERM map to `shutdown_all` on every live master. The listener
//! task is installed at most once per process no matter how many masters are
//! constructed; masters are tracked weakly so the bridge never keeps one
//! alive.

use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use crate::master::MasterInner;

const SIGNAL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

static MASTERS: OnceLock<Mutex<Vec<Weak<MasterInner>>>> = OnceLock::new();
static INSTALLED: OnceLock<()> = OnceLock::new();

pub(crate) fn register(inner: &Arc<MasterInner>) {
    let masters = MASTERS.get_or_init(|| Mutex::new(Vec::new()));
    {
        let mut masters = masters.lock().expect("signal registry lock");
        masters.retain(|weak| weak.strong_count() > 0);
        masters.push(Arc::downgrade(inner));
    }
    INSTALLED.get_or_init(|| {
        tokio::spawn(signal_loop());
    });
}

#[cfg(unix)]
async fn signal_loop() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to install SIGINT handler");
            return;
        }
    };
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to install SIGTERM handler");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
        fan_out().await;
    }
}

#[cfg(not(unix))]
async fn signal_loop() {
    loop {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        fan_out().await;
    }
}

async fn fan_out() {
    tracing::info!("termination signal received, shutting down all masters");
    let live: Vec<Arc<MasterInner>> = MASTERS
        .get()
        .map(|masters| {
            masters
                .lock()
                .expect("signal registry lock")
                .iter()
                .filter_map(Weak::upgrade)
                .collect()
        })
        .unwrap_or_default();

    for inner in live {
        inner.shutdown_all_inner(SIGNAL_SHUTDOWN_TIMEOUT).await;
    }
}
