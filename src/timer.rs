//! Priority-ordered pending timers. Generic over the "reason" payload so
//! this module stays decoupled from the message/coordinator types that
//! give timers their meaning.

use crate::node::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

struct Entry<R> {
    handle: TimerHandle,
    priority: i32,
    owner: NodeId,
    reason: R,
}

/// A single ordered list of `(priority, timer)` pairs; higher priority
/// sorts earlier, equal priorities keep insertion order.
#[derive(Debug)]
pub struct TimerManager<R> {
    pending: Vec<Entry<R>>,
    next_handle: u64,
}

impl<R> Default for TimerManager<R> {
    fn default() -> Self {
        Self {
            pending: Vec::new(),
            next_handle: 0,
        }
    }
}

impl<R> TimerManager<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// No-op (returns `None`) if the owning node is currently failed.
    pub fn start(
        &mut self,
        owner: NodeId,
        owner_failed: bool,
        priority: i32,
        reason: R,
    ) -> Option<TimerHandle> {
        if owner_failed {
            return None;
        }
        let handle = TimerHandle(self.next_handle);
        self.next_handle += 1;
        let pos = self
            .pending
            .iter()
            .position(|e| priority > e.priority)
            .unwrap_or(self.pending.len());
        self.pending.insert(
            pos,
            Entry {
                handle,
                priority,
                owner,
                reason,
            },
        );
        Some(handle)
    }

    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        if let Some(pos) = self.pending.iter().position(|e| e.handle == handle) {
            self.pending.remove(pos);
            true
        } else {
            false
        }
    }

    /// Drop every pending timer owned by `owner`, returning how many were
    /// removed. Used when a node is permanently removed from a simulation.
    pub fn cancel_owned_by(&mut self, owner: NodeId) -> usize {
        let before = self.pending.len();
        self.pending.retain(|e| e.owner != owner);
        before - self.pending.len()
    }

    /// Remove the first pending timer, skipping (without firing) any whose
    /// owner is currently failed, until a live one is found or the list is
    /// exhausted.
    pub fn pop(&mut self, is_failed: impl Fn(NodeId) -> bool) -> Option<(NodeId, R)> {
        while !self.pending.is_empty() {
            let entry = self.pending.remove(0);
            if is_failed(entry.owner) {
                continue;
            }
            return Some((entry.owner, entry.reason));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeKind, NodeTable};

    #[test]
    fn higher_priority_fires_first() {
        let mut table = NodeTable::new();
        let a = table.create(NodeKind::Replica, None);
        let mut timers: TimerManager<&'static str> = TimerManager::new();
        timers.start(a, false, 10, "low");
        timers.start(a, false, 20, "high");
        let (_, reason) = timers.pop(|id| table.is_failed(id)).unwrap();
        assert_eq!(reason, "high");
    }

    #[test]
    fn equal_priority_keeps_insertion_order() {
        let mut table = NodeTable::new();
        let a = table.create(NodeKind::Replica, None);
        let mut timers: TimerManager<&'static str> = TimerManager::new();
        timers.start(a, false, 10, "first");
        timers.start(a, false, 10, "second");
        let (_, r1) = timers.pop(|id| table.is_failed(id)).unwrap();
        let (_, r2) = timers.pop(|id| table.is_failed(id)).unwrap();
        assert_eq!((r1, r2), ("first", "second"));
    }

    #[test]
    fn no_op_for_failed_owner_at_start() {
        let mut table = NodeTable::new();
        let a = table.create(NodeKind::Replica, None);
        table.fail(a);
        let mut timers: TimerManager<&'static str> = TimerManager::new();
        assert!(timers.start(a, true, 10, "x").is_none());
        assert_eq!(timers.pending_count(), 0);
    }

    #[test]
    fn skips_timers_whose_owner_failed_before_pop() {
        let mut table = NodeTable::new();
        let a = table.create(NodeKind::Replica, None);
        let b = table.create(NodeKind::Replica, None);
        let mut timers: TimerManager<&'static str> = TimerManager::new();
        timers.start(a, false, 10, "a-timer");
        timers.start(b, false, 5, "b-timer");
        table.fail(a);
        let (owner, reason) = timers.pop(|id| table.is_failed(id)).unwrap();
        assert_eq!(owner, b);
        assert_eq!(reason, "b-timer");
        assert!(timers.pop(|id| table.is_failed(id)).is_none());
    }

    #[test]
    fn cancel_removes_pending_timer() {
        let mut table = NodeTable::new();
        let a = table.create(NodeKind::Replica, None);
        let mut timers: TimerManager<&'static str> = TimerManager::new();
        let handle = timers.start(a, false, 10, "x").unwrap();
        assert!(timers.cancel(handle));
        assert_eq!(timers.pending_count(), 0);
        assert!(!timers.cancel(handle));
    }

    #[test]
    fn cancel_owned_by_removes_only_that_owners_timers() {
        let mut table = NodeTable::new();
        let a = table.create(NodeKind::Replica, None);
        let b = table.create(NodeKind::Replica, None);
        let mut timers: TimerManager<&'static str> = TimerManager::new();
        timers.start(a, false, 10, "a1");
        timers.start(a, false, 5, "a2");
        timers.start(b, false, 1, "b1");
        assert_eq!(timers.cancel_owned_by(a), 2);
        assert_eq!(timers.pending_count(), 1);
        let (owner, _) = timers.pop(|id| table.is_failed(id)).unwrap();
        assert_eq!(owner, b);
    }
}
