//! Worker unit registries and lifecycle tracking.
//!
//! # Responsibilities
//! - Track server units (listeners, directory scanners) and client units
//! - Hold each unit's lifecycle state behind a per-unit lock
//! - O(1) client removal by unit id
//!
//! # State Machine
//! ```text
//! Spawning ──▶ Active ──▶ Close ──▶ Closing ──▶ Closed
//!     │           │                               ▲
//!     └───────────┴───────────────────────────────┘ (worker exit)
//! ```
//!
//! # Design Decisions
//! - Only the worker moves to Active/Closing/Closed; Close is a request
//!   set by the supervisor or the worker itself
//! - The registry lock is held only across map mutation, never across a
//!   join or any I/O
//! - Closed units are removed and joined before their records are dropped

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::client::ClientRecord;
use crate::net::listener::ListenerShared;
use crate::net::PeerAddr;
use crate::scanner::ScanJob;

/// Lifecycle state of a worker unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Created, worker not serving yet.
    Spawning,
    /// Worker announced it is serving.
    Active,
    /// Stop requested; the worker has not observed it yet.
    Close,
    /// Worker observed the request and is draining.
    Closing,
    /// Worker exited; safe to join and reap.
    Closed,
}

impl LifecycleState {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleState::Spawning => "SPAWNING",
            LifecycleState::Active => "ACTIVE",
            LifecycleState::Close => "CLOSE",
            LifecycleState::Closing => "CLOSING",
            LifecycleState::Closed => "CLOSED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Closed)
    }
}

/// A unit's lifecycle state behind its own lock, with a notifier so the
/// worker can wait for a close request without polling.
#[derive(Debug)]
pub struct LifecycleCell {
    state: Mutex<LifecycleState>,
    changed: Notify,
}

impl LifecycleCell {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LifecycleState::Spawning),
            changed: Notify::new(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock().expect("lifecycle lock poisoned")
    }

    /// Worker announces it is serving. Ignored if a close was already
    /// requested while the worker was spawning.
    pub fn set_active(&self) {
        let mut state = self.state.lock().expect("lifecycle lock poisoned");
        if *state == LifecycleState::Spawning {
            *state = LifecycleState::Active;
        }
    }

    /// Request the worker to stop. Returns true if the request was newly
    /// set, false if the unit is already stopping or stopped.
    pub fn request_close(&self) -> bool {
        let mut state = self.state.lock().expect("lifecycle lock poisoned");
        match *state {
            LifecycleState::Spawning | LifecycleState::Active => {
                *state = LifecycleState::Close;
                drop(state);
                self.changed.notify_waiters();
                true
            }
            _ => false,
        }
    }

    /// Worker acknowledges the close request and starts draining.
    pub fn set_closing(&self) {
        let mut state = self.state.lock().expect("lifecycle lock poisoned");
        if !state.is_terminal() {
            *state = LifecycleState::Closing;
        }
    }

    /// Worker exited, normally or not.
    pub fn set_closed(&self) {
        let mut state = self.state.lock().expect("lifecycle lock poisoned");
        *state = LifecycleState::Closed;
        drop(state);
        self.changed.notify_waiters();
    }

    /// Resolve once a close has been requested (or the unit is already
    /// past that point). The waiter registers before re-checking the state
    /// so a concurrent request is never missed.
    pub async fn close_requested(&self) {
        let notified = self.changed.notified();
        tokio::pin!(notified);
        loop {
            notified.as_mut().enable();
            if !matches!(
                self.state(),
                LifecycleState::Spawning | LifecycleState::Active
            ) {
                return;
            }
            notified.as_mut().await;
            notified.set(self.changed.notified());
        }
    }
}

impl Default for LifecycleCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a spawned worker task.
pub struct UnitHandle {
    pub lifecycle: Arc<LifecycleCell>,
    pub join: JoinHandle<()>,
}

/// Payload of a server unit slot.
pub enum ServerPayload {
    Listener(Arc<ListenerShared>),
    Scanner(Arc<ScanJob>),
}

/// One server unit slot: the payload survives worker restarts, the unit
/// handle is present only while a worker runs (or awaits reaping).
pub struct ServerSlot {
    pub payload: ServerPayload,
    pub unit: Option<UnitHandle>,
}

impl ServerSlot {
    pub fn new(payload: ServerPayload) -> Self {
        Self {
            payload,
            unit: None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self.payload {
            ServerPayload::Listener(_) => "Listener",
            ServerPayload::Scanner(_) => "Scanner",
        }
    }
}

/// One tracked client connection.
pub struct ClientUnit {
    pub record: Arc<ClientRecord>,
    pub lifecycle: Arc<LifecycleCell>,
    pub join: JoinHandle<()>,
}

/// Registry of live client units, shared between the listeners (insert,
/// per-source counting) and the supervisor (stats, eviction, reaping).
pub struct ClientRegistry {
    units: Mutex<HashMap<u64, ClientUnit>>,
    next_id: AtomicU64,
    count: AtomicUsize,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            units: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            count: AtomicUsize::new(0),
        }
    }

    /// Allocate a unit id for a client about to be admitted.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register an admitted client.
    pub fn insert(&self, unit: ClientUnit) {
        let id = unit.record.id;
        let mut units = self.units.lock().expect("client registry lock poisoned");
        units.insert(id, unit);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of registered, not-yet-reaped clients.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Count registered clients from the same source address.
    pub fn ip_count(&self, peer: &PeerAddr) -> usize {
        let units = self.units.lock().expect("client registry lock poisoned");
        units
            .values()
            .filter(|u| u.record.peer.same_source(peer))
            .count()
    }

    /// Request close on every client that is not already stopping.
    pub fn request_close_all(&self) {
        let units = self.units.lock().expect("client registry lock poisoned");
        for unit in units.values() {
            if unit.lifecycle.request_close() {
                tracing::debug!(client = unit.record.id, "Requesting shutdown of client");
            }
        }
    }

    /// Remove every Closed unit, decrementing the client count. The caller
    /// joins the returned handles outside the registry lock.
    pub fn take_closed(&self) -> Vec<ClientUnit> {
        let mut units = self.units.lock().expect("client registry lock poisoned");
        let closed_ids: Vec<u64> = units
            .iter()
            .filter(|(_, u)| u.lifecycle.state().is_terminal())
            .map(|(id, _)| *id)
            .collect();

        let mut reaped = Vec::with_capacity(closed_ids.len());
        for id in closed_ids {
            if let Some(unit) = units.remove(&id) {
                self.count.fetch_sub(1, Ordering::Relaxed);
                reaped.push(unit);
            }
        }
        reaped
    }

    /// Snapshot of the live (non-Closed) clients for the stats pass.
    pub fn live(&self) -> Vec<(Arc<ClientRecord>, Arc<LifecycleCell>)> {
        let units = self.units.lock().expect("client registry lock poisoned");
        units
            .values()
            .filter(|u| !u.lifecycle.state().is_terminal())
            .map(|u| (Arc::clone(&u.record), Arc::clone(&u.lifecycle)))
            .collect()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_transitions() {
        let cell = LifecycleCell::new();
        assert_eq!(cell.state(), LifecycleState::Spawning);

        cell.set_active();
        assert_eq!(cell.state(), LifecycleState::Active);

        assert!(cell.request_close());
        assert_eq!(cell.state(), LifecycleState::Close);

        // A second request is a no-op
        assert!(!cell.request_close());

        cell.set_closing();
        assert_eq!(cell.state(), LifecycleState::Closing);

        cell.set_closed();
        assert_eq!(cell.state(), LifecycleState::Closed);
    }

    #[test]
    fn test_active_does_not_override_close_request() {
        let cell = LifecycleCell::new();
        assert!(cell.request_close());
        cell.set_active();
        assert_eq!(cell.state(), LifecycleState::Close);
    }

    #[test]
    fn test_worker_may_close_from_any_state() {
        let cell = LifecycleCell::new();
        cell.set_closed();
        assert_eq!(cell.state(), LifecycleState::Closed);
        assert!(!cell.request_close());
    }

    #[tokio::test]
    async fn test_close_requested_wakes_waiter() {
        let cell = Arc::new(LifecycleCell::new());
        cell.set_active();

        let waiter = {
            let cell = Arc::clone(&cell);
            tokio::spawn(async move { cell.close_requested().await })
        };

        tokio::task::yield_now().await;
        cell.request_close();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter should resolve")
            .unwrap();
    }
}
