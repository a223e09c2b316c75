use super::ring::RingStore;
use super::{DropSink, FrontierError};
use crate::core::models::node::Node;
use crate::core::models::space::StateId;
use slotmap::{SlotMap, new_key_type};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use tracing::trace;

new_key_type! {
    struct NodeKey;
}

/// Total order over scores so they can key a `BTreeSet`.
#[derive(Debug, Clone, Copy)]
struct Score(f64);

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Best-score-first store with one memory budget shared by all states.
///
/// When memory is full the lowest-scoring node of any state is evicted. It
/// moves to the overflow rings when they have room and is otherwise dropped
/// through the [`DropSink`]. A state whose in-memory nodes run out is refilled
/// from its overflow ring.
#[derive(Debug)]
pub struct PriorityFrontier {
    nodes: SlotMap<NodeKey, Node>,
    by_state: Vec<BTreeSet<(Score, NodeKey)>>,
    capacity: usize,
    overflow: Option<RingStore>,
    evicted: u64,
}

impl PriorityFrontier {
    pub fn new(num_states: usize, capacity: usize, overflow: Option<RingStore>) -> Self {
        Self {
            nodes: SlotMap::with_key(),
            by_state: vec![BTreeSet::new(); num_states],
            capacity,
            overflow,
            evicted: 0,
        }
    }

    #[inline]
    pub fn num_states(&self) -> usize {
        self.by_state.len()
    }

    /// The in-memory capacity, shared across states.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn capacity_for(&self, _state: StateId) -> usize {
        self.capacity + self.overflow.as_ref().map_or(0, RingStore::capacity)
    }

    pub fn capacity_remaining(&self) -> usize {
        self.capacity.saturating_sub(self.nodes.len())
    }

    pub fn in_memory(&self) -> usize {
        self.nodes.len()
    }

    /// Nodes dropped through the sink so far.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn len(&self, state: StateId) -> usize {
        let memory = self.by_state.get(state.index()).map_or(0, BTreeSet::len);
        memory + self.overflow.as_ref().map_or(0, |o| o.len(state.index()))
    }

    pub fn pop(&mut self, state: StateId) -> Result<Option<Node>, FrontierError> {
        let Some(set) = self.by_state.get(state.index()) else {
            return Ok(None);
        };
        if set.is_empty() {
            if let Some(node) = self.refill(state)? {
                return Ok(Some(node));
            }
        }
        let Some((_, key)) = self.by_state[state.index()].pop_last() else {
            return Ok(None);
        };
        Ok(self.nodes.remove(key))
    }

    pub fn push(&mut self, node: Node, sink: &mut dyn DropSink) -> Result<(), FrontierError> {
        let state = node.state.index();
        if state >= self.by_state.len() {
            return Err(FrontierError::UnknownState { state: node.state });
        }
        let score = Score(node.score);
        let key = self.nodes.insert(node);
        self.by_state[state].insert((score, key));
        while self.nodes.len() > self.capacity {
            self.evict_lowest(sink)?;
        }
        Ok(())
    }

    fn evict_lowest(&mut self, sink: &mut dyn DropSink) -> Result<(), FrontierError> {
        let lowest = self
            .by_state
            .iter()
            .enumerate()
            .filter_map(|(s, set)| set.first().map(|entry| (*entry, s)))
            .min();
        let Some(((score, key), s)) = lowest else {
            return Ok(());
        };
        self.by_state[s].remove(&(score, key));
        let Some(node) = self.nodes.remove(key) else {
            return Ok(());
        };
        let rejected = match self.overflow.as_mut() {
            Some(overflow) => overflow.push_back(s, node)?,
            None => Some(node),
        };
        if let Some(node) = rejected {
            trace!(state = %node.state, conf = %node.conf, "Evicting frontier node.");
            self.evicted += 1;
            sink.on_drop(&node);
        }
        Ok(())
    }

    /// Moves overflow nodes of `state` back into memory. Returns a node directly
    /// when memory has no room for any.
    fn refill(&mut self, state: StateId) -> Result<Option<Node>, FrontierError> {
        let s = state.index();
        let Some(overflow) = self.overflow.as_mut() else {
            return Ok(None);
        };
        if overflow.is_empty(s) {
            return Ok(None);
        }
        let room = self.capacity.saturating_sub(self.nodes.len());
        if room == 0 {
            return overflow.pop_front(s);
        }
        for _ in 0..room {
            let Some(node) = overflow.pop_front(s)? else {
                break;
            };
            let score = Score(node.score);
            let key = self.nodes.insert(node);
            self.by_state[s].insert((score, key));
        }
        Ok(None)
    }

    pub fn nodes(&mut self, state: StateId) -> Result<Vec<Node>, FrontierError> {
        let s = state.index();
        let Some(set) = self.by_state.get(s) else {
            return Ok(Vec::new());
        };
        let mut nodes: Vec<Node> = set
            .iter()
            .rev()
            .filter_map(|(_, key)| self.nodes.get(*key).cloned())
            .collect();
        if let Some(overflow) = self.overflow.as_mut() {
            nodes.extend(overflow.nodes(s)?);
        }
        Ok(nodes)
    }

    /// Moves every in-memory node to the overflow rings so a later run can
    /// reopen them. Nodes that do not fit are dropped through `sink`. Returns
    /// the number of nodes moved.
    pub fn spill(&mut self, sink: &mut dyn DropSink) -> Result<usize, FrontierError> {
        let Some(overflow) = self.overflow.as_mut() else {
            return Ok(0);
        };
        let mut moved = 0;
        for (s, set) in self.by_state.iter_mut().enumerate() {
            while let Some((_, key)) = set.pop_last() {
                let Some(node) = self.nodes.remove(key) else {
                    continue;
                };
                match overflow.push_back(s, node)? {
                    Some(node) => {
                        self.evicted += 1;
                        sink.on_drop(&node);
                    }
                    None => moved += 1,
                }
            }
        }
        overflow.flush()?;
        Ok(moved)
    }

    pub fn flush(&mut self) -> Result<(), FrontierError> {
        match self.overflow.as_mut() {
            Some(overflow) => overflow.flush(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::records::RecordCodec;
    use crate::core::math::bigexp::BigExp;
    use crate::core::models::conf::Conf;
    use crate::engine::frontier::NoDrops;

    fn node(state: u8, choice: usize, score: f64) -> Node {
        Node::new(
            StateId(state),
            Conf::from_choices(&[choice]).unwrap(),
            BigExp::from_f64(score.exp()),
        )
        .with_score(score)
    }

    #[test]
    fn pops_best_score_first_per_state() {
        let mut f = PriorityFrontier::new(2, 8, None);
        let mut evictions = 0;
        let mut sink = |_: &Node| evictions += 1;
        f.push(node(0, 0, 1.0), &mut sink).unwrap();
        f.push(node(0, 1, 3.0), &mut sink).unwrap();
        f.push(node(1, 2, 9.0), &mut sink).unwrap();
        f.push(node(0, 3, 2.0), &mut sink).unwrap();
        assert_eq!(evictions, 0);

        let order: Vec<usize> = std::iter::from_fn(|| f.pop(StateId(0)).unwrap())
            .map(|n| n.conf.get(0).unwrap())
            .collect();
        assert_eq!(order, vec![1, 3, 0]);
        assert_eq!(f.len(StateId(1)), 1);
    }

    #[test]
    fn pushing_a_node_of_an_unknown_state_fails() {
        let mut f = PriorityFrontier::new(1, 4, None);
        let result = f.push(node(3, 0, 1.0), &mut NoDrops);
        assert!(matches!(
            result,
            Err(FrontierError::UnknownState { state: StateId(3) })
        ));
        assert_eq!(f.len(StateId(0)), 0);
    }

    #[test]
    fn pushing_into_a_full_store_of_one_evicts_exactly_once() {
        let mut f = PriorityFrontier::new(1, 1, None);
        let mut dropped: Vec<Node> = Vec::new();
        let mut sink = |n: &Node| dropped.push(n.clone());

        f.push(node(0, 0, 5.0), &mut sink).unwrap();
        f.push(node(0, 1, 2.0), &mut sink).unwrap();
        drop(sink);

        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].conf, Conf::from_choices(&[1]).unwrap());
        assert_eq!(f.evicted(), 1);
        assert_eq!(f.pop(StateId(0)).unwrap().unwrap().conf.get(0), Some(0));
    }

    #[test]
    fn eviction_picks_the_lowest_node_across_states() {
        let mut f = PriorityFrontier::new(2, 2, None);
        let mut dropped: Vec<Node> = Vec::new();
        let mut sink = |n: &Node| dropped.push(n.clone());
        f.push(node(0, 0, 4.0), &mut sink).unwrap();
        f.push(node(1, 0, -1.0), &mut sink).unwrap();
        f.push(node(0, 1, 0.5), &mut sink).unwrap();
        drop(sink);
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].state, StateId(1));
    }

    #[test]
    fn overflow_file_absorbs_evictions_and_refills_memory() {
        let dir = tempfile::tempdir().unwrap();
        let codec = RecordCodec::new(vec![1]);
        let bytes = (codec.record_size() * 2) as u64;
        let (overflow, _) =
            RingStore::disk(&dir.path().join("overflow"), codec, 1, bytes, true).unwrap();
        let mut f = PriorityFrontier::new(1, 1, Some(overflow));

        let mut dropped: Vec<Node> = Vec::new();
        let mut sink = |n: &Node| dropped.push(n.clone());
        for (choice, score) in [(0, 1.0), (1, 2.0), (2, 3.0), (3, 4.0)] {
            f.push(node(0, choice, score), &mut sink).unwrap();
        }
        drop(sink);

        // memory holds the best, the overflow ring the next two, the worst is dropped
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].conf.get(0), Some(2));
        assert_eq!(f.len(StateId(0)), 3);
        assert_eq!(f.capacity_for(StateId(0)), 3);

        let popped: Vec<usize> = std::iter::from_fn(|| f.pop(StateId(0)).unwrap())
            .map(|n| n.conf.get(0).unwrap())
            .collect();
        assert_eq!(popped, vec![3, 0, 1]);
    }

    #[test]
    fn spill_moves_memory_nodes_to_overflow_for_a_later_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overflow");
        let codec = RecordCodec::new(vec![1]);
        let bytes = (codec.record_size() * 2) as u64;
        let (overflow, _) = RingStore::disk(&path, codec.clone(), 1, bytes, true).unwrap();
        let mut f = PriorityFrontier::new(1, 4, Some(overflow));

        let mut dropped: Vec<Node> = Vec::new();
        let mut sink = |n: &Node| dropped.push(n.clone());
        for (choice, score) in [(0, 1.0), (1, 3.0), (2, 2.0)] {
            f.push(node(0, choice, score), &mut sink).unwrap();
        }
        assert_eq!(f.spill(&mut sink).unwrap(), 2);
        drop(sink);
        assert_eq!(dropped.len(), 1);
        assert_eq!(f.in_memory(), 0);
        drop(f);

        let (overflow, resumed) = RingStore::disk(&path, codec, 1, bytes, false).unwrap();
        assert!(resumed);
        let mut reopened = PriorityFrontier::new(1, 4, Some(overflow));
        assert_eq!(reopened.len(StateId(0)), 2);
        assert_eq!(reopened.pop(StateId(0)).unwrap().unwrap().conf.get(0), Some(1));
    }
}
