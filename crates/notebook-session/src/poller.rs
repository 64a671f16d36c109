//! Background session polling.
//!
//! The registry only learns about state changes when somebody asks the
//! server. [`SessionPoller`] owns a task that does that on a fixed interval
//! and stops when shut down or dropped.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::session::SessionRegistry;

pub struct SessionPoller {
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl SessionPoller {
    /// Start refreshing `registry` every `interval`. The first refresh
    /// happens immediately.
    pub fn spawn(registry: Arc<SessionRegistry>, interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let interval = interval.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            info!("[poller] Polling sessions every {:?}", interval);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match registry.refresh().await {
                            Ok(sessions) => debug!("[poller] {} sessions", sessions.len()),
                            Err(e) => warn!("[poller] Refresh failed: {}", e),
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("[poller] Stopped");
        });

        Self {
            shutdown_tx,
            handle: Some(handle),
        }
    }

    /// Stop polling and wait for the task to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!("[poller] Task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for SessionPoller {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
