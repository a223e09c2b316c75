//! Cross-worker control: the run flag, state focus and assignments, named
//! phase barriers and idempotent node mailboxes.

use crate::core::models::node::Node;
use crate::core::models::space::StateId;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CoordinationError {
    #[error(
        "Barrier '{barrier}' timed out after {waited:?} with {arrived} of {expected} members"
    )]
    Timeout {
        barrier: String,
        arrived: usize,
        expected: usize,
        waited: Duration,
    },

    #[error("Member arrived at barrier '{found}' while '{expected}' was in progress")]
    NameMismatch { expected: String, found: String },

    #[error("Barrier '{barrier}' was aborted")]
    Aborted { barrier: String },
}

/// Instructions the directing worker publishes to every member.
#[derive(Debug)]
pub struct Directions {
    running: AtomicBool,
    focused: Mutex<Option<StateId>>,
    assignments: Mutex<Vec<Option<StateId>>>,
}

impl Directions {
    pub fn new(num_members: usize) -> Self {
        Self {
            running: AtomicBool::new(true),
            focused: Mutex::new(None),
            assignments: Mutex::new(vec![None; num_members]),
        }
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn focused_state(&self) -> Option<StateId> {
        *self.focused.lock()
    }

    pub fn set_focused_state(&self, state: Option<StateId>) {
        *self.focused.lock() = state;
    }

    pub fn assignment(&self, member: usize) -> Option<StateId> {
        self.assignments.lock().get(member).copied().flatten()
    }

    pub fn assign(&self, member: usize, state: Option<StateId>) {
        if let Some(slot) = self.assignments.lock().get_mut(member) {
            *slot = state;
        }
    }

    /// The state `member` should work on: its assignment, else the focus.
    pub fn state_for(&self, member: usize) -> Option<StateId> {
        self.assignment(member).or_else(|| self.focused_state())
    }
}

#[derive(Debug, Default)]
struct BarrierState {
    name: Option<String>,
    arrived: usize,
    generation: u64,
    aborted: bool,
}

/// A reusable rendezvous where every member must arrive under the same name.
#[derive(Debug)]
pub struct PhaseBarrier {
    parties: usize,
    timeout: Duration,
    state: Mutex<BarrierState>,
    cvar: Condvar,
}

impl PhaseBarrier {
    pub fn new(parties: usize, timeout: Duration) -> Self {
        Self {
            parties,
            timeout,
            state: Mutex::new(BarrierState::default()),
            cvar: Condvar::new(),
        }
    }

    pub fn wait(&self, name: &str) -> Result<(), CoordinationError> {
        let mut state = self.state.lock();
        if state.aborted {
            return Err(CoordinationError::Aborted {
                barrier: name.to_string(),
            });
        }
        match &state.name {
            Some(current) if current != name => {
                return Err(CoordinationError::NameMismatch {
                    expected: current.clone(),
                    found: name.to_string(),
                });
            }
            Some(_) => {}
            None => state.name = Some(name.to_string()),
        }

        state.arrived += 1;
        if state.arrived == self.parties {
            debug!(barrier = name, parties = self.parties, "Barrier released.");
            state.arrived = 0;
            state.name = None;
            state.generation += 1;
            self.cvar.notify_all();
            return Ok(());
        }

        let generation = state.generation;
        let started = Instant::now();
        let deadline = started + self.timeout;
        while state.generation == generation {
            if state.aborted {
                return Err(CoordinationError::Aborted {
                    barrier: name.to_string(),
                });
            }
            if self.cvar.wait_until(&mut state, deadline).timed_out()
                && state.generation == generation
            {
                let arrived = state.arrived;
                error!(barrier = name, arrived, expected = self.parties, "Barrier timed out.");
                state.aborted = true;
                self.cvar.notify_all();
                return Err(CoordinationError::Timeout {
                    barrier: name.to_string(),
                    arrived,
                    expected: self.parties,
                    waited: started.elapsed(),
                });
            }
        }
        Ok(())
    }

    /// Fails every current and future wait.
    pub fn abort(&self) {
        let mut state = self.state.lock();
        state.aborted = true;
        self.cvar.notify_all();
    }
}

/// Transfer ids an inbox remembers for duplicate detection.
const SEEN_WINDOW: usize = 4096;

#[derive(Debug, Default)]
struct Inbox {
    queue: VecDeque<Node>,
    seen: HashSet<u64>,
    /// `seen` in delivery order, oldest first.
    seen_order: VecDeque<u64>,
}

impl Inbox {
    /// Records `id`; `false` if it is already among the recent ones.
    fn remember(&mut self, id: u64) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.seen_order.push_back(id);
        if self.seen_order.len() > SEEN_WINDOW {
            if let Some(oldest) = self.seen_order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

/// Per-member inboxes for nodes handed between members.
///
/// Each transfer carries an id; delivering the same id twice has no effect,
/// so a sender may retry a transfer without duplicating the node's mass.
/// Each inbox only remembers its last `SEEN_WINDOW` ids, so retries must
/// follow their first attempt closely.
#[derive(Debug)]
pub struct Mailboxes {
    inboxes: Vec<Mutex<Inbox>>,
    next_id: AtomicU64,
}

impl Mailboxes {
    pub fn new(num_members: usize) -> Self {
        Self {
            inboxes: (0..num_members).map(|_| Mutex::new(Inbox::default())).collect(),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn next_transfer_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Delivers `node` to `member`; returns `false` if `id` was already delivered.
    pub fn deliver(&self, member: usize, id: u64, node: Node) -> bool {
        let Some(inbox) = self.inboxes.get(member) else {
            return false;
        };
        let mut inbox = inbox.lock();
        if !inbox.remember(id) {
            return false;
        }
        inbox.queue.push_back(node);
        true
    }

    pub fn send(&self, member: usize, node: Node) -> bool {
        let id = self.next_transfer_id();
        self.deliver(member, id, node)
    }

    pub fn take_all(&self, member: usize) -> Vec<Node> {
        self.inboxes
            .get(member)
            .map(|inbox| inbox.lock().queue.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn len(&self, member: usize) -> usize {
        self.inboxes.get(member).map_or(0, |inbox| inbox.lock().queue.len())
    }

    pub fn total_len(&self) -> usize {
        (0..self.inboxes.len()).map(|m| self.len(m)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::math::bigexp::BigExp;
    use crate::core::models::conf::Conf;
    use std::sync::Arc;

    #[test]
    fn directions_prefer_assignments_over_focus() {
        let directions = Directions::new(2);
        assert!(directions.is_running());
        assert_eq!(directions.state_for(0), None);

        directions.set_focused_state(Some(StateId(1)));
        directions.assign(0, Some(StateId(0)));
        assert_eq!(directions.state_for(0), Some(StateId(0)));
        assert_eq!(directions.state_for(1), Some(StateId(1)));

        directions.stop();
        assert!(!directions.is_running());
    }

    #[test]
    fn barrier_releases_all_members_and_is_reusable() {
        let barrier = Arc::new(PhaseBarrier::new(3, Duration::from_secs(10)));
        for name in ["assemble", "teardown"] {
            std::thread::scope(|scope| {
                let handles: Vec<_> = (0..3)
                    .map(|_| scope.spawn(|| barrier.wait(name)))
                    .collect();
                for handle in handles {
                    assert_eq!(handle.join().unwrap(), Ok(()));
                }
            });
        }
    }

    #[test]
    fn barrier_times_out_when_a_member_never_arrives() {
        let barrier = PhaseBarrier::new(2, Duration::from_millis(50));
        let result = barrier.wait("roots");
        assert!(matches!(
            result,
            Err(CoordinationError::Timeout { arrived: 1, expected: 2, .. })
        ));
        // a timed out barrier stays broken
        assert!(matches!(
            barrier.wait("roots"),
            Err(CoordinationError::Aborted { .. })
        ));
    }

    #[test]
    fn barrier_rejects_a_different_name() {
        let barrier = Arc::new(PhaseBarrier::new(2, Duration::from_secs(5)));
        std::thread::scope(|scope| {
            let first = scope.spawn(|| barrier.wait("assemble"));
            while barrier.state.lock().arrived == 0 {
                std::thread::yield_now();
            }
            assert!(matches!(
                barrier.wait("teardown"),
                Err(CoordinationError::NameMismatch { .. })
            ));
            barrier.abort();
            assert!(matches!(
                first.join().unwrap(),
                Err(CoordinationError::Aborted { .. })
            ));
        });
    }

    #[test]
    fn repeated_transfer_ids_are_ignored() {
        let mailboxes = Mailboxes::new(2);
        let node = Node::new(StateId(0), Conf::unassigned(1), BigExp::ONE);
        let id = mailboxes.next_transfer_id();
        assert!(mailboxes.deliver(1, id, node.clone()));
        assert!(!mailboxes.deliver(1, id, node.clone()));
        assert!(mailboxes.send(1, node));
        assert_eq!(mailboxes.len(1), 2);
        assert_eq!(mailboxes.take_all(1).len(), 2);
        assert_eq!(mailboxes.total_len(), 0);
    }

    #[test]
    fn inboxes_only_remember_recent_transfer_ids() {
        let mailboxes = Mailboxes::new(1);
        let node = Node::new(StateId(0), Conf::unassigned(1), BigExp::ONE);
        let first = mailboxes.next_transfer_id();
        assert!(mailboxes.deliver(0, first, node.clone()));
        for _ in 0..SEEN_WINDOW + 10 {
            mailboxes.send(0, node.clone());
            mailboxes.take_all(0);
        }
        let inbox = mailboxes.inboxes[0].lock();
        assert_eq!(inbox.seen.len(), SEEN_WINDOW);
        assert_eq!(inbox.seen_order.len(), SEEN_WINDOW);
        assert!(!inbox.seen.contains(&first));
        drop(inbox);

        // a recent id is still refused
        let recent = mailboxes.next_transfer_id() - 1;
        assert!(!mailboxes.deliver(0, recent, node));
        assert_eq!(mailboxes.len(0), 0);
    }
}
