//! Per-connection table of outstanding requests
//!
//! Each entry owns a one-shot completion slot. Whatever resolves an entry
//! (result, error, deadline, connection loss) removes it from the map under
//! the lock first, so the slot is completed exactly once and later attempts
//! find nothing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{CloseReason, CorrelationError, RequestError};
use crate::events::{EventBus, ProtocolEvent};
use crate::types::{Action, CorrelationId, Payload};

/// Final outcome of one request
pub type Resolution = Result<Payload, RequestError>;

struct PendingRequest {
    action: Action,
    issued_at: Instant,
    deadline: Instant,
    slot: oneshot::Sender<Resolution>,
}

#[derive(Clone)]
pub struct CorrelationTable {
    pending: Arc<Mutex<HashMap<CorrelationId, PendingRequest>>>,
    request_timeout: Duration,
    events: EventBus,
}

impl CorrelationTable {
    pub fn new(request_timeout: Duration, events: EventBus) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            request_timeout,
            events,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Allocate a fresh id and its pending entry
    pub fn register(&self, action: Action) -> PendingResponse {
        let mut pending = self.pending.lock();
        let mut id = CorrelationId::generate();
        while pending.contains_key(&id) {
            id = CorrelationId::generate();
        }
        self.insert(&mut pending, id, action)
    }

    /// Register under a caller-chosen id
    pub fn register_with_id(
        &self,
        id: CorrelationId,
        action: Action,
    ) -> Result<PendingResponse, CorrelationError> {
        let mut pending = self.pending.lock();
        if pending.contains_key(&id) {
            return Err(CorrelationError::Duplicate(id));
        }
        Ok(self.insert(&mut pending, id, action))
    }

    fn insert(
        &self,
        pending: &mut HashMap<CorrelationId, PendingRequest>,
        id: CorrelationId,
        action: Action,
    ) -> PendingResponse {
        let (slot, rx) = oneshot::channel();
        let issued_at = Instant::now();
        let deadline = issued_at + self.request_timeout;
        pending.insert(
            id.clone(),
            PendingRequest {
                action: action.clone(),
                issued_at,
                deadline,
                slot,
            },
        );
        PendingResponse {
            id,
            action,
            deadline,
            rx,
            table: self.clone(),
        }
    }

    /// Complete the entry for `id`.
    ///
    /// Returns the action of the resolved request, or `Unknown` when nothing
    /// is pending under that id (stray or late response).
    pub fn resolve(&self, id: &CorrelationId, outcome: Resolution) -> Result<Action, CorrelationError> {
        let entry = self.pending.lock().remove(id);
        match entry {
            Some(entry) => {
                debug!(
                    "Resolved {} ({}) after {:?}",
                    id,
                    entry.action,
                    entry.issued_at.elapsed()
                );
                // The waiter may have given up already; that is fine
                let _ = entry.slot.send(outcome);
                Ok(entry.action)
            }
            None => Err(CorrelationError::Unknown(id.clone())),
        }
    }

    /// Action of a pending request
    pub fn action_of(&self, id: &CorrelationId) -> Option<Action> {
        self.pending.lock().get(id).map(|entry| entry.action.clone())
    }

    /// Resolve one entry with Timeout. No-op if already resolved.
    pub fn expire(&self, id: &CorrelationId) -> bool {
        let entry = self.pending.lock().remove(id);
        match entry {
            Some(entry) => {
                self.timed_out(id.clone(), entry);
                true
            }
            None => false,
        }
    }

    /// Resolve every entry whose deadline has passed
    pub fn expire_overdue(&self, now: Instant) -> Vec<CorrelationId> {
        let overdue: Vec<(CorrelationId, PendingRequest)> = {
            let mut pending = self.pending.lock();
            let ids: Vec<CorrelationId> = pending
                .iter()
                .filter(|(_, entry)| entry.deadline <= now)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        overdue
            .into_iter()
            .map(|(id, entry)| {
                self.timed_out(id.clone(), entry);
                id
            })
            .collect()
    }

    fn timed_out(&self, id: CorrelationId, entry: PendingRequest) {
        warn!("Request {} ({}) timed out", id, entry.action);
        self.events.publish(ProtocolEvent::RequestTimedOut {
            correlation_id: id,
            action: entry.action,
        });
        let _ = entry.slot.send(Err(RequestError::Timeout));
    }

    /// Fail every outstanding request with ConnectionClosed.
    ///
    /// Synchronous: by the time this returns the table is empty and every
    /// waiter has its outcome.
    pub fn cancel_all(&self, reason: CloseReason) -> usize {
        let drained: Vec<(CorrelationId, PendingRequest)> = self.pending.lock().drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            debug!("Cancelling {} ({}): {}", id, entry.action, reason);
            let _ = entry
                .slot
                .send(Err(RequestError::ConnectionClosed(reason.clone())));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.pending.lock().contains_key(id)
    }
}

impl std::fmt::Debug for CorrelationTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationTable")
            .field("pending", &self.len())
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Caller's half of a pending request
pub struct PendingResponse {
    id: CorrelationId,
    action: Action,
    deadline: Instant,
    rx: oneshot::Receiver<Resolution>,
    table: CorrelationTable,
}

impl PendingResponse {
    pub fn id(&self) -> &CorrelationId {
        &self.id
    }

    pub fn action(&self) -> &Action {
        &self.action
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Suspend until the request resolves. Never outlives the deadline.
    pub async fn wait(self) -> Resolution {
        let PendingResponse {
            id, mut rx, table, deadline, ..
        } = self;

        match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(resolution)) => resolution,
            Ok(Err(_)) => Err(RequestError::ConnectionClosed(CloseReason::Local)),
            Err(_) => {
                // Deadline passed: expire unless someone resolved it in the meantime
                table.expire(&id);
                match rx.await {
                    Ok(resolution) => resolution,
                    Err(_) => Err(RequestError::Timeout),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table() -> CorrelationTable {
        CorrelationTable::new(Duration::from_secs(30), EventBus::default())
    }

    #[tokio::test]
    async fn test_resolve_once() {
        let table = table();
        let pending = table.register("Heartbeat".into());
        let id = pending.id().clone();

        assert_eq!(table.resolve(&id, Ok(json!({"a": 1}))).unwrap(), "Heartbeat");
        assert_eq!(
            table.resolve(&id, Ok(json!({"a": 2}))),
            Err(CorrelationError::Unknown(id.clone()))
        );
        assert!(!table.expire(&id));
        assert_eq!(pending.wait().await.unwrap(), json!({"a": 1}));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_ids_are_distinct() {
        let table = table();
        let a = table.register("Heartbeat".into());
        let b = table.register("Heartbeat".into());
        assert_ne!(a.id(), b.id());
        assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let table = table();
        let _first = table.register_with_id("7".into(), "Reset".into()).unwrap();
        assert!(matches!(
            table.register_with_id("7".into(), "Reset".into()),
            Err(CorrelationError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_all_drains() {
        let table = table();
        let waiters: Vec<_> = (0..3).map(|_| table.register("Heartbeat".into())).collect();
        assert_eq!(table.cancel_all(CloseReason::PeerClosed), 3);
        assert!(table.is_empty());
        for waiter in waiters {
            assert_eq!(
                waiter.wait().await,
                Err(RequestError::ConnectionClosed(CloseReason::PeerClosed))
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let table = CorrelationTable::new(Duration::from_secs(5), EventBus::default());
        let pending = table.register("Heartbeat".into());
        let started = Instant::now();
        assert_eq!(pending.wait().await, Err(RequestError::Timeout));
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_overdue_sweep() {
        let table = CorrelationTable::new(Duration::from_secs(5), EventBus::default());
        let early = table.register("Heartbeat".into());
        tokio::time::advance(Duration::from_secs(3)).await;
        let late = table.register("Heartbeat".into());

        tokio::time::advance(Duration::from_secs(3)).await;
        let expired = table.expire_overdue(Instant::now());
        assert_eq!(expired, vec![early.id().clone()]);
        assert!(table.contains(late.id()));
        assert_eq!(early.wait().await, Err(RequestError::Timeout));
    }
}
