//! # Session Scheduler
//!
//! Admission and fairness for the shared test capacity. The state is a plain
//! struct driven by the server loop; every method takes the current instant
//! so the queue logic is deterministic under test.
//!
//! ```text
//!   accept ─► check_capacity ─► login ─► submit ─┬─► Dispatch (slot free, nobody ahead)
//!                                                └─► queue ─► tick ─► Dispatch
//!                                                               ├───► Notify(position)
//!                                                               ├───► Evict(stale head)
//!                                                               └───► Probe(deep queue)
//! ```
//!
//! Single mode runs one session at a time. Multi mode runs up to
//! `max_clients` and fills free slots greedily in arrival order. A session
//! leaves the queue exactly once, through [`SchedulerState::reap`], an
//! eviction, a failed probe, or a fault reset.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ndt_proto::{QueueStatus, SessionId};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::ServerConfig;

/// Estimated duration of one session slot.
pub const SLOT_ESTIMATE: Duration = Duration::from_secs(45);
/// Queues longer than this get zombie-probed.
pub const PROBE_DEPTH: usize = 5;
/// Entries at the front of the queue that are never probed.
pub const PROBE_SKIP: usize = 4;

/// Queue bookkeeping disagrees with itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerFault {
    #[error("active count {counted} does not match {marked} running entries")]
    ActiveMismatch { counted: usize, marked: usize },
    #[error("{active} sessions active with capacity {capacity}")]
    OverCapacity { active: usize, capacity: usize },
}

// ─── Entries & actions ───────────────────────────────────────────────────────

/// A logged-in client asking for a slot.
#[derive(Debug, Clone)]
pub struct Arrival {
    pub id: SessionId,
    pub client: SocketAddr,
    /// Client answers heartbeats with `MSG_WAITING`.
    pub status_capable: bool,
}

#[derive(Debug, Clone)]
struct Entry {
    id: SessionId,
    client: SocketAddr,
    estimated_start: Instant,
    status_capable: bool,
    running: bool,
    probing: bool,
}

/// Result of [`SchedulerState::submit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// A slot was free; the session is running.
    Dispatch,
    /// Queued. `position` is sent to the client when present.
    Queued { position: Option<u32> },
    /// Turned away with this status.
    Rejected(QueueStatus),
}

/// Work the server loop performs after a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Dispatch(SessionId),
    Notify { id: SessionId, status: QueueStatus },
    /// Stale head, already removed from the queue. Tell it busy and cancel it.
    Evict(SessionId),
    /// Heartbeat these waiting clients and report back through
    /// [`SchedulerState::probe_finished`].
    Probe(Vec<SessionId>),
    /// Bookkeeping fault. Every listed session was dropped from the queue.
    Reset { sessions: Vec<SessionId>, fault: SchedulerFault },
}

// ─── State ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct SchedulerState {
    multiple: bool,
    max_clients: usize,
    queue_enabled: bool,
    stale_after: Duration,
    entries: VecDeque<Entry>,
    active: usize,
}

impl SchedulerState {
    pub fn new(multiple: bool, max_clients: usize, queue_enabled: bool, stale_after: Duration) -> Self {
        SchedulerState {
            multiple,
            max_clients: max_clients.max(1),
            queue_enabled,
            stale_after,
            entries: VecDeque::new(),
            active: 0,
        }
    }

    pub fn from_config(cfg: &ServerConfig) -> Self {
        Self::new(cfg.multiple, cfg.max_clients, cfg.queue, cfg.timeouts.stale_after)
    }

    /// Sessions allowed to run at once.
    pub fn capacity(&self) -> usize {
        if self.multiple {
            self.max_clients
        } else {
            1
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn active(&self) -> usize {
        self.active
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.entries.iter().any(|e| &e.id == id)
    }

    /// Whether a new connection may proceed to login.
    pub fn check_capacity(&self) -> Result<(), QueueStatus> {
        let waiting = self.entries.len();
        let limit = if self.multiple {
            4 * self.max_clients - 1
        } else {
            (self.max_clients - 1).max(1)
        };
        if waiting >= limit {
            return Err(QueueStatus::ServerBusy);
        }
        Ok(())
    }

    /// Enqueue a logged-in client, dispatching it at once when a slot is
    /// free and nobody is waiting ahead of it.
    pub fn submit(&mut self, arrival: Arrival, now: Instant) -> Admission {
        let ahead = self.entries.len();
        let can_start = self.active < self.capacity() && self.entries.iter().all(|e| e.running);
        if !can_start && !self.queue_enabled {
            return Admission::Rejected(QueueStatus::BusyRetryLater);
        }

        let slots = if self.multiple { ahead / self.max_clients } else { ahead };
        let mut entry = Entry {
            id: arrival.id,
            client: arrival.client,
            estimated_start: now + SLOT_ESTIMATE * slots as u32,
            status_capable: arrival.status_capable,
            running: false,
            probing: false,
        };
        if can_start {
            entry.running = true;
            entry.estimated_start = entry.estimated_start.max(now);
            self.active += 1;
            self.entries.push_back(entry);
            return Admission::Dispatch;
        }
        self.entries.push_back(entry);

        let waiting = self.entries.len();
        let position = if self.multiple {
            (waiting >= self.max_clients).then(|| (waiting / self.max_clients) as u32)
        } else {
            (waiting > 1).then(|| (waiting - 1) as u32)
        };
        Admission::Queued { position }
    }

    /// Remove a session. Returns `false` when it was already gone.
    pub fn reap(&mut self, id: &SessionId) -> bool {
        let Some(idx) = self.entries.iter().position(|e| &e.id == id) else {
            return false;
        };
        if let Some(e) = self.entries.remove(idx) {
            if e.running {
                self.active = self.active.saturating_sub(1);
            }
        }
        true
    }

    /// A probe of `id` finished. Non-responders are reaped; returns whether
    /// the session was removed.
    pub fn probe_finished(&mut self, id: &SessionId, alive: bool) -> bool {
        if !alive {
            return self.reap(id);
        }
        if let Some(e) = self.entries.iter_mut().find(|e| &e.id == id) {
            e.probing = false;
        }
        false
    }

    /// Empty the queue, returning every session that was in it.
    pub fn drain(&mut self) -> Vec<SessionId> {
        self.active = 0;
        self.entries.drain(..).map(|e| e.id).collect()
    }

    fn validate(&self) -> Result<(), SchedulerFault> {
        let marked = self.entries.iter().filter(|e| e.running).count();
        if marked != self.active {
            return Err(SchedulerFault::ActiveMismatch {
                counted: self.active,
                marked,
            });
        }
        if self.active > self.capacity() {
            return Err(SchedulerFault::OverCapacity {
                active: self.active,
                capacity: self.capacity(),
            });
        }
        Ok(())
    }

    /// Advance the queue: fault check, stale eviction, dispatch, position
    /// updates and zombie probes, in that order.
    pub fn tick(&mut self, now: Instant) -> Vec<Action> {
        if let Err(fault) = self.validate() {
            let sessions = self.drain();
            return vec![Action::Reset { sessions, fault }];
        }

        let mut actions = Vec::new();

        while let Some(head) = self.entries.front() {
            if now.saturating_duration_since(head.estimated_start) <= self.stale_after {
                break;
            }
            let id = head.id.clone();
            tracing::debug!(session = %id, client = %head.client, running = head.running, "queue head is stale");
            self.reap(&id);
            actions.push(Action::Evict(id));
        }

        let capacity = self.capacity();
        for e in self.entries.iter_mut() {
            if self.active >= capacity || e.probing {
                break;
            }
            if e.running {
                continue;
            }
            e.running = true;
            e.estimated_start = e.estimated_start.max(now);
            self.active += 1;
            actions.push(Action::Dispatch(e.id.clone()));
        }

        for (ahead, e) in self.entries.iter().enumerate() {
            if e.running || e.probing {
                continue;
            }
            let position = if self.multiple {
                (ahead / self.max_clients).max(1)
            } else {
                ahead.max(1)
            };
            actions.push(Action::Notify {
                id: e.id.clone(),
                status: QueueStatus::Position(position as u32),
            });
        }

        if self.entries.len() > PROBE_DEPTH {
            let targets: Vec<SessionId> = self
                .entries
                .iter_mut()
                .skip(PROBE_SKIP)
                .filter(|e| !e.running && !e.probing && e.status_capable)
                .map(|e| {
                    e.probing = true;
                    e.id.clone()
                })
                .collect();
            if !targets.is_empty() {
                actions.push(Action::Probe(targets));
            }
        }

        actions
    }

    #[cfg(test)]
    fn corrupt_active(&mut self, active: usize) {
        self.active = active;
    }
}

// ─── Shared handle ───────────────────────────────────────────────────────────

/// The scheduler state behind the single lock every mutation goes through.
#[derive(Clone)]
pub struct SchedulerHandle {
    inner: Arc<Mutex<SchedulerState>>,
}

impl SchedulerHandle {
    pub fn new(state: SchedulerState) -> Self {
        SchedulerHandle {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    pub async fn check_capacity(&self) -> Result<(), QueueStatus> {
        self.inner.lock().await.check_capacity()
    }

    pub async fn submit(&self, arrival: Arrival) -> Admission {
        self.inner.lock().await.submit(arrival, Instant::now())
    }

    pub async fn tick(&self) -> Vec<Action> {
        self.inner.lock().await.tick(Instant::now())
    }

    pub async fn reap(&self, id: &SessionId) -> bool {
        self.inner.lock().await.reap(id)
    }

    pub async fn probe_finished(&self, id: &SessionId, alive: bool) -> bool {
        self.inner.lock().await.probe_finished(id, alive)
    }

    pub async fn contains(&self, id: &SessionId) -> bool {
        self.inner.lock().await.contains(id)
    }

    pub async fn drain(&self) -> Vec<SessionId> {
        self.inner.lock().await.drain()
    }

    /// `(queued, active)` counts.
    pub async fn counts(&self) -> (usize, usize) {
        let s = self.inner.lock().await;
        (s.len(), s.active())
    }

    #[cfg(test)]
    pub(crate) async fn corrupt_active(&self, active: usize) {
        self.inner.lock().await.corrupt_active(active);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arrival(n: u8, status: bool) -> Arrival {
        Arrival {
            id: SessionId::new(),
            client: SocketAddr::from(([10, 0, 0, n], 40000 + n as u16)),
            status_capable: status,
        }
    }

    fn dispatched(actions: &[Action]) -> Vec<SessionId> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Dispatch(id) => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn single_mode_runs_one_at_a_time() {
        let now = Instant::now();
        let mut s = SchedulerState::new(false, 50, true, Duration::from_secs(60));
        let a = arrival(1, false);
        let b = arrival(2, false);
        let c = arrival(3, false);
        let (ida, idb, idc) = (a.id.clone(), b.id.clone(), c.id.clone());

        assert_eq!(s.submit(a, now), Admission::Dispatch);
        assert_eq!(s.submit(b, now), Admission::Queued { position: Some(1) });
        assert_eq!(s.submit(c, now), Admission::Queued { position: Some(2) });
        assert!(dispatched(&s.tick(now)).is_empty());

        assert!(s.reap(&ida));
        assert_eq!(dispatched(&s.tick(now)), vec![idb.clone()]);
        assert!(s.reap(&idb));
        let actions = s.tick(now);
        assert_eq!(dispatched(&actions), vec![idc]);
        assert_eq!(s.active(), 1);
    }

    #[test]
    fn waiting_clients_get_their_position_each_tick() {
        let now = Instant::now();
        let mut s = SchedulerState::new(false, 50, true, Duration::from_secs(60));
        let ids: Vec<_> = (1..=3)
            .map(|n| {
                let a = arrival(n, false);
                let id = a.id.clone();
                s.submit(a, now);
                id
            })
            .collect();
        let actions = s.tick(now);
        assert!(actions.contains(&Action::Notify {
            id: ids[1].clone(),
            status: QueueStatus::Position(1)
        }));
        assert!(actions.contains(&Action::Notify {
            id: ids[2].clone(),
            status: QueueStatus::Position(2)
        }));
    }

    #[test]
    fn multi_mode_fills_slots_greedily() {
        let now = Instant::now();
        let mut s = SchedulerState::new(true, 2, true, Duration::from_secs(60));
        assert_eq!(s.submit(arrival(1, false), now), Admission::Dispatch);
        assert_eq!(s.submit(arrival(2, false), now), Admission::Dispatch);
        assert_eq!(s.submit(arrival(3, false), now), Admission::Queued { position: Some(1) });
        assert_eq!(s.active(), 2);
        let actions = s.tick(now);
        assert!(dispatched(&actions).is_empty());
        assert!(matches!(
            actions.as_slice(),
            [Action::Notify { status: QueueStatus::Position(1), .. }]
        ));
    }

    #[test]
    fn capacity_limits() {
        let now = Instant::now();
        let mut single = SchedulerState::new(false, 3, true, Duration::from_secs(60));
        single.submit(arrival(1, false), now);
        assert_eq!(single.check_capacity(), Ok(()));
        single.submit(arrival(2, false), now);
        assert_eq!(single.check_capacity(), Err(QueueStatus::ServerBusy));

        let mut multi = SchedulerState::new(true, 1, true, Duration::from_secs(60));
        multi.submit(arrival(1, false), now);
        multi.submit(arrival(2, false), now);
        assert_eq!(multi.check_capacity(), Ok(()));
        multi.submit(arrival(3, false), now);
        assert_eq!(multi.check_capacity(), Err(QueueStatus::ServerBusy));
    }

    #[test]
    fn disabled_queue_rejects_instead_of_waiting() {
        let now = Instant::now();
        let mut s = SchedulerState::new(false, 50, false, Duration::from_secs(60));
        assert_eq!(s.submit(arrival(1, false), now), Admission::Dispatch);
        assert_eq!(
            s.submit(arrival(2, false), now),
            Admission::Rejected(QueueStatus::BusyRetryLater)
        );
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn stale_head_is_evicted_and_reaped_once() {
        let start = Instant::now();
        let mut s = SchedulerState::new(false, 50, true, Duration::from_secs(60));
        let a = arrival(1, false);
        let b = arrival(2, false);
        let (ida, idb) = (a.id.clone(), b.id.clone());
        s.submit(a, start);
        s.submit(b, start);

        assert!(!s.tick(start + Duration::from_secs(30)).contains(&Action::Evict(ida.clone())));

        let later = start + Duration::from_secs(61);
        let actions = s.tick(later);
        let evictions: Vec<_> = actions.iter().filter(|a| matches!(a, Action::Evict(_))).collect();
        assert_eq!(evictions, vec![&Action::Evict(ida.clone())]);
        assert!(!s.contains(&ida));
        assert_eq!(dispatched(&actions), vec![idb]);

        // The worker's own completion arrives afterwards and finds nothing.
        assert!(!s.reap(&ida));
        assert!(!s
            .tick(later + Duration::from_secs(1))
            .iter()
            .any(|a| matches!(a, Action::Evict(_))));
    }

    #[test]
    fn deep_queues_probe_status_clients_past_the_front() {
        let now = Instant::now();
        let mut s = SchedulerState::new(false, 50, true, Duration::from_secs(60));
        let ids: Vec<_> = (1..=7)
            .map(|n| {
                let a = arrival(n, n != 6);
                let id = a.id.clone();
                s.submit(a, now);
                id
            })
            .collect();
        let actions = s.tick(now);
        let probe = actions.iter().find_map(|a| match a {
            Action::Probe(ids) => Some(ids.clone()),
            _ => None,
        });
        assert_eq!(probe, Some(vec![ids[4].clone(), ids[6].clone()]));

        // Probes in flight are not repeated.
        assert!(!s.tick(now).iter().any(|a| matches!(a, Action::Probe(_))));

        assert!(s.probe_finished(&ids[4], false));
        assert!(!s.probe_finished(&ids[6], true));
        assert_eq!(s.len(), 6);
        assert!(!s.contains(&ids[4]));
    }

    #[test]
    fn bookkeeping_fault_resets_the_queue() {
        let now = Instant::now();
        let mut s = SchedulerState::new(false, 50, true, Duration::from_secs(60));
        s.submit(arrival(1, false), now);
        s.submit(arrival(2, false), now);
        s.corrupt_active(3);
        let actions = s.tick(now);
        match actions.as_slice() {
            [Action::Reset { sessions, fault }] => {
                assert_eq!(sessions.len(), 2);
                assert_eq!(
                    *fault,
                    SchedulerFault::ActiveMismatch { counted: 3, marked: 1 }
                );
            }
            other => panic!("unexpected actions {other:?}"),
        }
        assert!(s.is_empty());
        assert_eq!(s.active(), 0);
    }
}
