use crate::core::models::node::Node;
use crate::core::models::space::StateId;

/// Leaves waiting to be evaluated together, one bounded queue per state.
///
/// Queued leaves are still in flight: their bounds stay pending in the ledger
/// until the batch is flushed.
#[derive(Debug)]
pub struct MinimizationQueue {
    batch_size: usize,
    queues: Vec<Vec<Node>>,
}

impl MinimizationQueue {
    pub fn new(num_states: usize, batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            queues: vec![Vec::new(); num_states],
        }
    }

    #[inline]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Queues a leaf and hands back the full batch once it reaches the batch size.
    pub fn push(&mut self, node: Node) -> Option<(StateId, Vec<Node>)> {
        let state = node.state;
        let queue = self.queues.get_mut(state.index())?;
        queue.push(node);
        if queue.len() >= self.batch_size {
            Some((state, std::mem::take(queue)))
        } else {
            None
        }
    }

    pub fn take(&mut self, state: StateId) -> Vec<Node> {
        self.queues
            .get_mut(state.index())
            .map(std::mem::take)
            .unwrap_or_default()
    }

    /// Takes any non-empty queue, preferring `state`.
    pub fn take_any(&mut self, state: Option<StateId>) -> Option<(StateId, Vec<Node>)> {
        let preferred = state.filter(|&s| self.len(s) > 0);
        let state = preferred.or_else(|| {
            self.queues
                .iter()
                .position(|q| !q.is_empty())
                .map(|i| StateId(i as u8))
        })?;
        Some((state, self.take(state)))
    }

    pub fn len(&self, state: StateId) -> usize {
        self.queues.get(state.index()).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(Vec::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::math::bigexp::BigExp;
    use crate::core::models::conf::Conf;

    fn leaf(state: u8, choice: usize) -> Node {
        Node::new(
            StateId(state),
            Conf::from_choices(&[choice]).unwrap(),
            BigExp::ONE,
        )
    }

    #[test]
    fn full_batches_are_handed_back() {
        let mut queue = MinimizationQueue::new(2, 2);
        assert!(queue.push(leaf(0, 0)).is_none());
        assert!(queue.push(leaf(1, 0)).is_none());
        let (state, batch) = queue.push(leaf(0, 1)).unwrap();
        assert_eq!(state, StateId(0));
        assert_eq!(batch.len(), 2);
        assert_eq!(queue.len(StateId(0)), 0);
        assert_eq!(queue.len(StateId(1)), 1);
    }

    #[test]
    fn take_any_prefers_the_requested_state() {
        let mut queue = MinimizationQueue::new(2, 8);
        queue.push(leaf(0, 0));
        queue.push(leaf(1, 0));
        let (state, _) = queue.take_any(Some(StateId(1))).unwrap();
        assert_eq!(state, StateId(1));
        let (state, _) = queue.take_any(Some(StateId(1))).unwrap();
        assert_eq!(state, StateId(0));
        assert!(queue.take_any(None).is_none());
        assert!(queue.is_empty());
    }
}
