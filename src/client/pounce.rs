//! FIFO fairness layer above acquire.
//!
//! A pounce is a queued intent to take a currently held lock. Pouncers on
//! the same object are granted strictly in queue order; a direct acquire
//! that bypasses the queue can still win the race for a freed lock, so the
//! ordering guarantee holds only among pouncers.
//!
//! Every pouncer runs the same loop over a watch stream: on a release it
//! tries to take the lock *for the queue head* (not for itself), pops the
//! head on success, and finishes either when it observes itself as the new
//! holder or when its own acquire-for-head made it the holder.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use crate::client::watcher::{LockStateEvent, Watcher};
use crate::client::{ClientError, Descriptor, LockRpc};

/// Coordinates per-object FIFO queues of waiting owners.
pub struct PounceCoordinator<C: LockRpc + 'static> {
    client: Arc<C>,
    watcher: Watcher<C>,
    queues: Arc<Mutex<HashMap<String, VecDeque<String>>>>,
}

impl<C: LockRpc> Clone for PounceCoordinator<C> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            watcher: Watcher::new(self.client.clone()),
            queues: self.queues.clone(),
        }
    }
}

impl<C: LockRpc + 'static> PounceCoordinator<C> {
    pub fn new(client: Arc<C>) -> Self {
        Self {
            watcher: Watcher::new(client.clone()),
            queues: Arc::new(Mutex::new(HashMap::new())),
            client,
        }
    }

    pub fn with_poll_interval(client: Arc<C>, poll_interval: Duration) -> Self {
        Self {
            watcher: Watcher::with_poll_interval(client.clone(), poll_interval),
            queues: Arc::new(Mutex::new(HashMap::new())),
            client,
        }
    }

    /// Owners currently queued for `object`, in grant order.
    pub fn pouncers(&self, object: &str) -> Vec<String> {
        self.queues
            .lock()
            .get(object)
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn remove_pouncer(&self, object: &str, owner: &str) {
        let mut queues = self.queues.lock();
        if let Some(queue) = queues.get_mut(object) {
            queue.retain(|queued| queued != owner);
            if queue.is_empty() {
                queues.remove(object);
            }
        }
    }

    /// Queue for `object` until `owner` is granted the lock.
    ///
    /// Returns immediately after a direct acquire when the object is free.
    /// With `allow_when_queued` false, a non-empty queue rejects the call
    /// with `AlreadyQueued`; an owner can never be queued twice either way.
    /// A `quit` signal withdraws the owner from the queue and returns Ok.
    pub async fn pounce(
        &self,
        object: &str,
        owner: &str,
        mut quit: watch::Receiver<bool>,
        allow_when_queued: bool,
    ) -> Result<(), ClientError> {
        {
            let queues = self.queues.lock();
            if let Some(queue) = queues.get(object) {
                if !allow_when_queued && !queue.is_empty() {
                    return Err(ClientError::AlreadyQueued);
                }
                if queue.iter().any(|queued| queued == owner) {
                    return Err(ClientError::AlreadyQueued);
                }
            }
        }

        match self.client.check_acquire(object).await? {
            // Free: single-shot direct acquire, no queueing.
            None => return self.client.acquire(&Descriptor::new(object, owner)).await,
            Some(holder) => {
                debug!(object, owner, %holder, "object held, joining pounce queue");
                self.queues
                    .lock()
                    .entry(object.to_owned())
                    .or_default()
                    .push_back(owner.to_owned());
            }
        }

        let (watch_quit_tx, watch_quit_rx) = watch::channel(false);
        let mut events = self.watcher.watch(object.to_owned(), watch_quit_rx);

        loop {
            tokio::select! {
                changed = quit.changed() => {
                    if changed.is_err() || *quit.borrow() {
                        // The owner may be anywhere in the queue, not just at
                        // the head.
                        self.remove_pouncer(object, owner);
                        let _ = watch_quit_tx.send(true);
                        return Ok(());
                    }
                }
                event = events.recv() => {
                    match event {
                        Some(LockStateEvent::Released) => {
                            if let Some(granted) = self.grant_head(object, owner).await? {
                                let _ = watch_quit_tx.send(true);
                                return Ok(granted);
                            }
                        }
                        Some(LockStateEvent::Acquired(holder)) if holder == owner => {
                            // Another pouncer's loop acquired on our behalf.
                            self.remove_pouncer(object, owner);
                            let _ = watch_quit_tx.send(true);
                            return Ok(());
                        }
                        Some(LockStateEvent::Acquired(_)) => {}
                        None => {
                            self.remove_pouncer(object, owner);
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// Try to hand the freed lock to the queue head.
    ///
    /// `Ok(Some(()))` means this call's loop is finished: either the caller
    /// was the head and now holds the lock, or the queue drained.
    async fn grant_head(&self, object: &str, owner: &str) -> Result<Option<()>, ClientError> {
        let head = match self.queues.lock().get(object).and_then(|queue| queue.front().cloned()) {
            Some(head) => head,
            None => return Ok(None),
        };

        // Re-probe: an external acquire may have won the race already.
        let still_free = match self.client.check_acquire(object).await {
            Ok(state) => state.is_none(),
            Err(err) => {
                self.remove_pouncer(object, owner);
                return Err(err);
            }
        };
        if !still_free {
            return Ok(None);
        }

        match self.client.acquire(&Descriptor::new(object, head.clone())).await {
            Ok(()) => {
                let queue_empty = {
                    let mut queues = self.queues.lock();
                    match queues.get_mut(object) {
                        Some(queue) => {
                            if queue.front() == Some(&head) {
                                queue.pop_front();
                            }
                            let empty = queue.is_empty();
                            if empty {
                                queues.remove(object);
                            }
                            empty
                        }
                        None => true,
                    }
                };
                debug!(object, granted = %head, "pounce granted");
                if head == owner || queue_empty {
                    Ok(Some(()))
                } else {
                    Ok(None)
                }
            }
            // A concurrent pouncer or an external acquire beat us to it;
            // keep waiting for the next release.
            Err(ClientError::Rejected { .. }) => Ok(None),
            Err(err) => {
                self.remove_pouncer(object, owner);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use tokio::time::timeout;

    use crate::client::testing::InProcessRpc;

    use super::*;

    const POLL: Duration = Duration::from_millis(10);

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn free_object_is_acquired_directly() {
        let rpc = Arc::new(InProcessRpc::new());
        let coordinator = PounceCoordinator::with_poll_interval(rpc.clone(), POLL);
        let (_quit_tx, quit_rx) = watch::channel(false);

        coordinator.pounce("obj", "p1", quit_rx, false).await.unwrap();
        assert_eq!(rpc.store().lookup("obj").as_deref(), Some("p1"));
        assert!(coordinator.pouncers("obj").is_empty());
    }

    #[tokio::test]
    async fn queued_object_rejects_unless_allowed() {
        let rpc = Arc::new(InProcessRpc::new());
        rpc.store().acquire("obj", "s0").unwrap();
        let coordinator = Arc::new(PounceCoordinator::with_poll_interval(rpc.clone(), POLL));
        let (quit_tx, quit_rx) = watch::channel(false);

        let background = {
            let coordinator = coordinator.clone();
            let quit_rx = quit_rx.clone();
            tokio::spawn(async move { coordinator.pounce("obj", "p1", quit_rx, true).await })
        };
        wait_until(|| coordinator.pouncers("obj") == ["p1"]).await;

        let rejected = coordinator.pounce("obj", "p2", quit_rx.clone(), false).await;
        assert!(matches!(rejected, Err(ClientError::AlreadyQueued)));

        // The same owner can't queue twice even when queueing is allowed.
        let duplicate = coordinator.pounce("obj", "p1", quit_rx, true).await;
        assert!(matches!(duplicate, Err(ClientError::AlreadyQueued)));

        quit_tx.send(true).unwrap();
        background.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cancellation_removes_owner_from_queue() {
        let rpc = Arc::new(InProcessRpc::new());
        rpc.store().acquire("obj", "s0").unwrap();
        let coordinator = Arc::new(PounceCoordinator::with_poll_interval(rpc.clone(), POLL));
        let (quit_tx, quit_rx) = watch::channel(false);

        let pounce = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.pounce("obj", "p1", quit_rx, true).await })
        };
        wait_until(|| coordinator.pouncers("obj") == ["p1"]).await;

        quit_tx.send(true).unwrap();
        timeout(Duration::from_secs(2), pounce).await.unwrap().unwrap().unwrap();
        assert!(coordinator.pouncers("obj").is_empty());
        // s0 still holds the object.
        assert_eq!(rpc.store().lookup("obj").as_deref(), Some("s0"));
    }

    #[tokio::test]
    async fn fifo_ordering_grants_in_pounce_order() {
        let rpc = Arc::new(InProcessRpc::new());
        rpc.store().acquire("obj", "s0").unwrap();
        let coordinator = Arc::new(PounceCoordinator::with_poll_interval(rpc.clone(), POLL));
        let (_quit_tx, quit_rx) = watch::channel(false);

        let mut pounces = Vec::new();
        for (index, owner) in ["p1", "p2", "p3"].into_iter().enumerate() {
            let coordinator_task = coordinator.clone();
            let quit_rx = quit_rx.clone();
            pounces.push(tokio::spawn(async move {
                coordinator_task.pounce("obj", owner, quit_rx, true).await
            }));
            wait_until(|| coordinator.pouncers("obj").len() == index + 1).await;
        }
        assert_eq!(coordinator.pouncers("obj"), ["p1", "p2", "p3"]);

        rpc.store().release("obj", "s0").unwrap();
        timeout(Duration::from_secs(5), pounces.remove(0)).await.unwrap().unwrap().unwrap();
        assert_eq!(rpc.store().lookup("obj").as_deref(), Some("p1"));
        wait_until(|| coordinator.pouncers("obj") == ["p2", "p3"]).await;

        rpc.store().release("obj", "p1").unwrap();
        timeout(Duration::from_secs(5), pounces.remove(0)).await.unwrap().unwrap().unwrap();
        assert_eq!(rpc.store().lookup("obj").as_deref(), Some("p2"));
        wait_until(|| coordinator.pouncers("obj") == ["p3"]).await;

        rpc.store().release("obj", "p2").unwrap();
        timeout(Duration::from_secs(5), pounces.remove(0)).await.unwrap().unwrap().unwrap();
        assert_eq!(rpc.store().lookup("obj").as_deref(), Some("p3"));
        assert!(coordinator.pouncers("obj").is_empty());
    }
}
