//! Poll-based lock state watcher.
//!
//! Turns repeated `checkAcquire` probes into a deduplicated event stream:
//! the current state is emitted once when the watch starts, then only on
//! transitions. The stream runs until the quit channel fires and is not
//! restartable; callers wanting a fresh stream call [`Watcher::watch`] again.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::client::LockRpc;
use crate::constants::WATCH_POLL_INTERVAL;

/// State transition of a watched object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStateEvent {
    Released,
    Acquired(String),
}

/// Factory for watch streams over one transport.
pub struct Watcher<C: LockRpc> {
    client: Arc<C>,
    poll_interval: Duration,
}

impl<C: LockRpc + 'static> Watcher<C> {
    pub fn new(client: Arc<C>) -> Self {
        Self {
            client,
            poll_interval: WATCH_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(client: Arc<C>, poll_interval: Duration) -> Self {
        Self {
            client,
            poll_interval,
        }
    }

    /// Start watching `object`. Events arrive on the returned channel until
    /// `quit` fires, then the channel closes.
    pub fn watch(
        &self,
        object: impl Into<String>,
        mut quit: watch::Receiver<bool>,
    ) -> mpsc::Receiver<LockStateEvent> {
        let (tx, rx) = mpsc::channel(16);
        let client = self.client.clone();
        let object = object.into();
        let poll_interval = self.poll_interval;

        tokio::spawn(async move {
            let mut last: Option<LockStateEvent> = None;
            loop {
                match client.check_acquire(&object).await {
                    Ok(state) => {
                        let event = match state {
                            Some(owner) => LockStateEvent::Acquired(owner),
                            None => LockStateEvent::Released,
                        };
                        if last.as_ref() != Some(&event) {
                            last = Some(event.clone());
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    // A failed probe is skipped; the next tick retries.
                    Err(err) => debug!(object = %object, error = %err, "watch probe failed"),
                }

                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    changed = quit.changed() => {
                        if changed.is_err() || *quit.borrow() {
                            return;
                        }
                    }
                }
            }
        });

        rx
    }
}
