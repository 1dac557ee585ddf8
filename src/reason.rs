//! Timer "reason" payloads. A single `TimerManager<TimerReason>` backs the
//! whole simulation so coordinator, ping, and client timers compete on one
//! priority-then-insertion ordered list, with default priorities ordering
//! coordinator retries ahead of client retries ahead of ping retries.

use crate::message::Key;
use crate::node::NodeId;

#[derive(Debug, Clone, Copy)]
pub enum ReplicaTimerReason {
    PutTimeout { put_id: u64, target: NodeId },
    GetTimeout { get_id: u64, target: NodeId },
    PingRetry { target: NodeId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientOp {
    Put,
    Get,
}

#[derive(Debug, Clone)]
pub enum ClientTimerReason {
    ResponseTimeout { op: ClientOp, key: Key },
}

#[derive(Debug, Clone)]
pub enum TimerReason {
    Replica(ReplicaTimerReason),
    Client(ClientTimerReason),
}

pub type SimTimers = crate::timer::TimerManager<TimerReason>;
