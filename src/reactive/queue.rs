//! Depth-ordered work queue.
//!
//! `poll()` always yields the shallowest pending node (FIFO among equal
//! depths), which guarantees ancestors run before descendants within a
//! batch. Entries are never removed eagerly on disposal; the runtime
//! validates each popped id against the arena and skips stale ones.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use super::arena::NodeId;

#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct Entry {
    depth: u32,
    seq: u64,
    id: NodeId,
}

#[derive(Default)]
pub(crate) struct WorkQueue {
    heap: BinaryHeap<Reverse<Entry>>,
    seq: u64,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, id: NodeId, depth: u32) {
        let seq = self.seq;
        self.seq += 1;
        self.heap.push(Reverse(Entry { depth, seq, id }));
    }

    /// Pop the shallowest entry. The caller is responsible for skipping
    /// ids that no longer resolve to a queued node.
    pub fn pop(&mut self) -> Option<NodeId> {
        self.heap.pop().map(|Reverse(e)| e.id)
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(index: u32) -> NodeId {
        NodeId {
            index,
            generation: 0,
        }
    }

    #[test]
    fn test_shallowest_first() {
        let mut q = WorkQueue::new();
        q.push(id(1), 3);
        q.push(id(2), 1);
        q.push(id(3), 2);
        assert_eq!(q.pop(), Some(id(2)));
        assert_eq!(q.pop(), Some(id(3)));
        assert_eq!(q.pop(), Some(id(1)));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_fifo_within_depth() {
        let mut q = WorkQueue::new();
        q.push(id(10), 1);
        q.push(id(11), 1);
        q.push(id(12), 1);
        assert_eq!(q.pop(), Some(id(10)));
        assert_eq!(q.pop(), Some(id(11)));
        assert_eq!(q.pop(), Some(id(12)));
    }
}
