//! Vector clock causal metadata, plus an optional bounded variant that
//! truncates to the K most recently touched nodes.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DynamoError;

/// A node-name -> monotonic-counter map, partially ordered by pointwise
/// domination.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    clock: BTreeMap<String, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, node: &str) -> Option<u64> {
        self.clock.get(node).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.clock.is_empty()
    }

    pub fn len(&self) -> usize {
        self.clock.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.clock.iter().map(|(n, &c)| (n.as_str(), c))
    }

    /// Record `node: counter`. Fails if `node` is already present with a
    /// counter that is not strictly less than `counter` -- the caller tried
    /// to go backwards (or sideways) in its own sequence.
    pub fn update(&mut self, node: impl Into<String>, counter: u64) -> Result<(), DynamoError> {
        let node = node.into();
        if let Some(&previous) = self.clock.get(&node) {
            if counter <= previous {
                return Err(DynamoError::ClockRegression {
                    node,
                    previous,
                    attempted: counter,
                });
            }
        }
        self.clock.insert(node, counter);
        Ok(())
    }

    /// `self <= other`: every node present in `self` appears in `other`
    /// with a counter at least as large.
    fn dominated_by(&self, other: &Self) -> bool {
        self.clock
            .iter()
            .all(|(node, &counter)| matches!(other.clock.get(node), Some(&oc) if counter <= oc))
    }

    /// Coalesce a set of clocks into the antichain of its maximal elements:
    /// no result entry is `<=` another, and every input is `<=` some result
    /// entry.
    pub fn coalesce(clocks: impl IntoIterator<Item = VectorClock>) -> Vec<VectorClock> {
        let mut result: Vec<VectorClock> = Vec::new();
        for vc in clocks {
            if result.iter().any(|slot| vc.dominated_by(slot)) {
                continue;
            }
            result.retain(|slot| !slot.dominated_by(&vc));
            result.push(vc);
        }
        result
    }

    /// Pointwise maximum of a set of clocks.
    pub fn converge(clocks: impl IntoIterator<Item = VectorClock>) -> VectorClock {
        let mut result = VectorClock::new();
        for vc in clocks {
            for (node, counter) in vc.clock {
                result
                    .clock
                    .entry(node)
                    .and_modify(|c| *c = (*c).max(counter))
                    .or_insert(counter);
            }
        }
        result
    }
}

impl PartialOrd for VectorClock {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self.dominated_by(other), other.dominated_by(self)) {
            (true, true) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Less),
            (false, true) => Some(Ordering::Greater),
            (false, false) => None,
        }
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (node, counter)) in self.clock.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{node}:{counter}")?;
        }
        write!(f, "}}")
    }
}

/// The heterogeneous metadata slot passed between client and coordinator: it
/// shows up as `None`, as a single clock, or as a list of sibling clocks
/// surfaced by a divergent read. Coordinators normalise on ingress (see
/// `coordinator.rs`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum Clock {
    #[default]
    None,
    One(VectorClock),
    Many(Vec<VectorClock>),
}

impl Clock {
    pub fn into_clocks(self) -> Vec<VectorClock> {
        match self {
            Clock::None => Vec::new(),
            Clock::One(vc) => vec![vc],
            Clock::Many(vcs) => vcs,
        }
    }
}

/// Bounded-size vector clock: retains at most `K` distinct node entries,
/// evicting the least-recently-updated one on overflow. Truncation preserves
/// `update` monotonicity for the entries that survive.
#[derive(Debug, Clone, Default)]
pub struct TruncatingVectorClock<const K: usize> {
    inner: VectorClock,
    /// Insertion/update order, oldest first; used to pick an eviction
    /// victim in the absence of wall-clock timestamps.
    order: VecDeque<String>,
}

impl<const K: usize> TruncatingVectorClock<K> {
    pub fn new() -> Self {
        Self {
            inner: VectorClock::new(),
            order: VecDeque::new(),
        }
    }

    pub fn as_vector_clock(&self) -> &VectorClock {
        &self.inner
    }

    pub fn update(&mut self, node: impl Into<String>, counter: u64) -> Result<(), DynamoError> {
        let node = node.into();
        self.inner.update(node.clone(), counter)?;
        self.order.retain(|n| n != &node);
        self.order.push_back(node);
        while self.order.len() > K {
            if let Some(oldest) = self.order.pop_front() {
                self.inner.clock.remove(&oldest);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn clock(pairs: &[(&str, u64)]) -> VectorClock {
        let mut vc = VectorClock::new();
        for (n, c) in pairs {
            vc.update(*n, *c).unwrap();
        }
        vc
    }

    #[test]
    fn update_monotone() {
        let mut vc = VectorClock::new();
        vc.update("A", 1).unwrap();
        vc.update("A", 2).unwrap();
        assert_eq!(vc.get("A"), Some(2));
        assert!(vc.update("A", 2).is_err());
        assert!(vc.update("A", 1).is_err());
    }

    #[test]
    fn display_sorted() {
        let mut vc = VectorClock::new();
        vc.update("B", 1).unwrap();
        vc.update("A", 200).unwrap();
        assert_eq!(vc.to_string(), "{A:200,B:1}");
    }

    #[test]
    fn equality_ignores_insertion_order() {
        let c1 = clock(&[("A", 200), ("B", 1)]);
        let c2 = clock(&[("B", 1), ("A", 200)]);
        assert_eq!(c1, c2);
    }

    #[test]
    fn order_incomparable_when_divergent() {
        let base = clock(&[("A", 1), ("B", 2)]);
        let mut c3 = base.clone();
        c3.update("X", 200).unwrap();
        let mut c4 = base.clone();
        c4.update("Y", 100).unwrap();
        assert!(!(c3 < c4));
        assert!(!(c4 < c3));
        assert_ne!(c3, c4);
        assert_eq!(base.partial_cmp(&c3), Some(Ordering::Less));
        assert_eq!(c3.partial_cmp(&base), Some(Ordering::Greater));
    }

    #[test]
    fn coalesce_matches_reference_example() {
        let c1 = clock(&[("A", 1), ("B", 2)]);
        let mut c3 = c1.clone();
        c3.update("X", 200).unwrap();
        let mut c4 = c1.clone();
        c4.update("Y", 100).unwrap();

        assert_eq!(VectorClock::coalesce([c1.clone(), c1.clone(), c1.clone()]), vec![c1.clone()]);
        assert_eq!(
            VectorClock::coalesce([c1.clone(), c3.clone(), c4.clone()]),
            vec![c3.clone(), c4.clone()]
        );
        assert_eq!(
            VectorClock::coalesce([c3.clone(), c1, c3.clone(), c4.clone()]),
            vec![c3, c4]
        );
    }

    #[test]
    fn converge_matches_reference_example() {
        let mut c1 = clock(&[("A", 1), ("B", 2)]);
        let c2 = clock(&[("A", 1), ("B", 2)]);
        let mut c3 = c1.clone();
        c3.update("X", 200).unwrap();
        let c4 = c1.clone();
        c1.update("Y", 100).unwrap();

        let cx = VectorClock::converge([c1.clone(), c2.clone(), c3.clone(), c4.clone()]);
        assert_eq!(cx.to_string(), "{A:1,B:2,X:200,Y:100}");

        let coalesced = VectorClock::coalesce([c1, c2, c3, c4]);
        let cy = VectorClock::converge(coalesced);
        assert_eq!(cy.to_string(), "{A:1,B:2,X:200,Y:100}");
    }

    #[test]
    fn truncation_evicts_oldest() {
        let mut vc = TruncatingVectorClock::<3>::new();
        vc.update("A", 1).unwrap();
        vc.update("B", 1).unwrap();
        vc.update("C", 1).unwrap();
        assert_eq!(vc.as_vector_clock().len(), 3);
        vc.update("D", 1).unwrap();
        assert_eq!(vc.as_vector_clock().len(), 3);
        assert_eq!(vc.as_vector_clock().get("A"), None);
        assert_eq!(vc.as_vector_clock().get("D"), Some(1));
    }

    proptest! {
        #[test]
        fn converge_idempotent(a in 0u64..50, b in 0u64..50) {
            let c1 = clock(&[("A", a.max(1))]);
            let c2 = clock(&[("B", b.max(1))]);
            let once = VectorClock::converge([c1.clone(), c2.clone()]);
            let twice = VectorClock::converge([once.clone(), once.clone()]);
            prop_assert_eq!(once, twice);
        }

        #[test]
        fn converge_dominates_inputs(a in 1u64..50, b in 1u64..50) {
            let c1 = clock(&[("A", a)]);
            let c2 = clock(&[("B", b)]);
            let merged = VectorClock::converge([c1.clone(), c2.clone()]);
            prop_assert!(c1 <= merged);
            prop_assert!(c2 <= merged);
        }

        #[test]
        fn converge_commutative(a in 1u64..50, b in 1u64..50) {
            let c1 = clock(&[("A", a)]);
            let c2 = clock(&[("B", b)]);
            let ab = VectorClock::converge([c1.clone(), c2.clone()]);
            let ba = VectorClock::converge([c2, c1]);
            prop_assert_eq!(ab, ba);
        }

        #[test]
        fn coalesce_is_stable(a in 1u64..50, b in 1u64..50) {
            let c1 = clock(&[("A", a)]);
            let c2 = clock(&[("B", b)]);
            let once = VectorClock::coalesce([c1.clone(), c2.clone()]);
            let twice = VectorClock::coalesce(once.clone());
            prop_assert_eq!(once, twice);
        }
    }
}
