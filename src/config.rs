//! Run parameters. A single `DynamoParams` value is threaded through a
//! `Simulation` as data instead of process-wide globals, so multiple
//! simulations can coexist.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamoParams {
    /// Replication factor: size of a key's preference list.
    pub n: usize,
    /// Read quorum.
    pub r: usize,
    /// Write quorum.
    pub w: usize,
    /// Virtual nodes per physical replica on the hash ring.
    pub virtual_nodes: usize,
    /// Priorities timers are started at; there is no wall-clock delay in
    /// this simulator, only the ordering these impose among timers pending
    /// at the same quiescent point. Higher fires first.
    pub coordinator_timer_priority: i32,
    pub client_timer_priority: i32,
    pub ping_timer_priority: i32,
}

impl Default for DynamoParams {
    fn default() -> Self {
        Self {
            n: 3,
            r: 2,
            w: 2,
            virtual_nodes: 10,
            coordinator_timer_priority: 20,
            client_timer_priority: 17,
            ping_timer_priority: 15,
        }
    }
}

impl DynamoParams {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_parameters() {
        let params = DynamoParams::default();
        assert_eq!((params.n, params.r, params.w), (3, 2, 2));
        assert!(params.r + params.w > params.n, "quorum overlap invariant");
    }
}
