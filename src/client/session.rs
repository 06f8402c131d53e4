//! Session-scoped acquire/release orchestration.
//!
//! A session ties a process's acquisitions together for a bounded lifetime.
//! When the session lease elapses, the manager fires the session's cancel
//! channel (aborting any in-flight call with `SessionExpired`) and then
//! releases every holding the session still owns, best-effort.
//!
//! One mutex guards the session table; it is never held across an await.
//! Network calls race against the cancel channel with `tokio::select!`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::client::{ClientError, Descriptor, LockRpc};

/// Opaque identity of one connected session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    pub session_id: Uuid,
    pub client_id: Uuid,
    /// The id used as the owner in every descriptor this session issues.
    pub process_id: Uuid,
}

#[derive(Debug)]
struct SessionState {
    holdings: Vec<Descriptor>,
    cancel: watch::Receiver<bool>,
}

#[derive(Debug, Default)]
struct SessionTable {
    sessions: HashMap<Uuid, SessionState>,
    /// Process ids whose session has been reaped; kept so late calls get
    /// `SessionExpired` rather than `SessionInexistent`.
    expired: HashSet<Uuid>,
}

/// Creates sessions, runs their lease timers, and brokers lock calls.
pub struct SessionManager<C: LockRpc + 'static> {
    client: Arc<C>,
    session_lease: Duration,
    table: Arc<Mutex<SessionTable>>,
}

impl<C: LockRpc> Clone for SessionManager<C> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            session_lease: self.session_lease,
            table: self.table.clone(),
        }
    }
}

impl<C: LockRpc + 'static> SessionManager<C> {
    pub fn new(client: Arc<C>, session_lease: Duration) -> Self {
        Self {
            client,
            session_lease,
            table: Arc::new(Mutex::new(SessionTable::default())),
        }
    }

    /// Create a session and start its lease timer.
    pub fn connect(&self) -> Session {
        let session = Session {
            session_id: Uuid::new_v4(),
            client_id: Uuid::new_v4(),
            process_id: Uuid::new_v4(),
        };
        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.table.lock().sessions.insert(
            session.process_id,
            SessionState {
                holdings: Vec::new(),
                cancel: cancel_rx,
            },
        );

        let manager = self.clone();
        let lease = self.session_lease;
        let process_id = session.process_id;
        tokio::spawn(async move {
            tokio::time::sleep(lease).await;
            debug!(%process_id, "session lease elapsed");
            let _ = cancel_tx.send(true);
            drop(cancel_tx);
            manager.graceful_shutdown(process_id).await;
        });

        session
    }

    fn cancel_channel(&self, session: &Session) -> Result<watch::Receiver<bool>, ClientError> {
        let table = self.table.lock();
        match table.sessions.get(&session.process_id) {
            Some(state) => Ok(state.cancel.clone()),
            None if table.expired.contains(&session.process_id) => Err(ClientError::SessionExpired),
            None => Err(ClientError::SessionInexistent),
        }
    }

    /// Acquire `object` on behalf of `session`.
    ///
    /// Aborts with `SessionExpired` if the session's timer fires first. A
    /// request already on the wire may still reach the server; the shutdown
    /// pass and the server-side lease cover that window.
    pub async fn acquire(&self, object: &str, session: &Session) -> Result<(), ClientError> {
        let cancel = self.cancel_channel(session)?;
        let desc = Descriptor::new(object, session.process_id.to_string());

        tokio::select! {
            result = self.client.acquire(&desc) => result?,
            _ = cancelled(cancel) => return Err(ClientError::SessionExpired),
        }

        let mut table = self.table.lock();
        if let Some(state) = table.sessions.get_mut(&session.process_id) {
            state.holdings.push(desc);
        }
        Ok(())
    }

    /// Release `object` on behalf of `session`.
    pub async fn release(&self, object: &str, session: &Session) -> Result<(), ClientError> {
        let cancel = self.cancel_channel(session)?;
        let desc = Descriptor::new(object, session.process_id.to_string());

        tokio::select! {
            result = self.client.release(&desc) => result?,
            _ = cancelled(cancel) => return Err(ClientError::SessionExpired),
        }

        let mut table = self.table.lock();
        if let Some(state) = table.sessions.get_mut(&session.process_id) {
            state.holdings.retain(|held| held != &desc);
        }
        Ok(())
    }

    /// Release every holding of the session, then drop it.
    ///
    /// Release failures are logged and skipped; shutdown never propagates
    /// errors.
    pub async fn graceful_shutdown(&self, process_id: Uuid) {
        let holdings = {
            let mut table = self.table.lock();
            match table.sessions.remove(&process_id) {
                Some(state) => {
                    table.expired.insert(process_id);
                    state.holdings
                }
                None => return,
            }
        };
        for desc in holdings {
            if let Err(err) = self.client.release(&desc).await {
                warn!(object = %desc.file_id, error = %err, "shutdown release failed");
            }
        }
    }

    /// Current holdings of a live session, empty once it expired.
    pub fn holdings(&self, session: &Session) -> Vec<Descriptor> {
        self.table
            .lock()
            .sessions
            .get(&session.process_id)
            .map(|state| state.holdings.clone())
            .unwrap_or_default()
    }
}

async fn cancelled(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        // A closed channel counts as cancellation.
        if rx.changed().await.is_err() {
            return;
        }
    }
}
