//! Client-node behaviour: issue `put`/`get`, retry on response timeout.
//!
//! Client-facing messages carry no request id, so an outstanding request is
//! identified by `(operation, key)` -- a client is expected to have at most
//! one request per key in flight at a time.

use std::collections::HashMap;

use rand::Rng;

use crate::clock::Clock;
use crate::config::DynamoParams;
use crate::history::{Event, History, Tag};
use crate::message::{ClientGet, ClientGetRsp, ClientPut, ClientPutRsp, Key, Message, Value};
use crate::node::{NodeId, NodeTable};
use crate::reason::{ClientOp, ClientTimerReason, SimTimers, TimerReason};
use crate::scheduler::Scheduler;

pub type ClientTimers = SimTimers;

#[derive(Debug, Clone)]
struct PendingRequest {
    value: Option<Value>,
    metadata: Clock,
    timer: Option<crate::timer::TimerHandle>,
}

#[derive(Debug, Default)]
struct ClientState {
    outstanding: HashMap<(ClientOp, Key), PendingRequest>,
    last_put: Option<ClientPutRsp>,
    last_get: Option<ClientGetRsp>,
}

/// Per-node client protocol state for every client in a simulation.
#[derive(Debug, Default)]
pub struct Clients {
    states: HashMap<NodeId, ClientState>,
}

impl Clients {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure(&mut self, id: NodeId) -> &mut ClientState {
        self.states.entry(id).or_default()
    }

    pub fn last_put(&self, id: NodeId) -> Option<&ClientPutRsp> {
        self.states.get(&id).and_then(|s| s.last_put.as_ref())
    }

    pub fn last_get(&self, id: NodeId) -> Option<&ClientGetRsp> {
        self.states.get(&id).and_then(|s| s.last_get.as_ref())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn put<R: Rng>(
        &mut self,
        self_id: NodeId,
        key: Key,
        value: Value,
        metadata: Clock,
        destnode: Option<NodeId>,
        nodes: &NodeTable,
        scheduler: &mut Scheduler,
        timers: &mut ClientTimers,
        history: &mut History,
        params: &DynamoParams,
        rng: &mut R,
    ) {
        let Some(target) = destnode.or_else(|| pick_replica(nodes, rng)) else {
            tracing::warn!(node = %self_id, "no replica available to receive put");
            return;
        };
        scheduler.send(
            Message::from(ClientPut {
                from: self_id,
                to: target,
                key: key.clone(),
                value: value.clone(),
                metadata: metadata.clone(),
            }),
            history,
        );
        let timer = timers.start(
            self_id,
            nodes.is_failed(self_id),
            params.client_timer_priority,
            TimerReason::Client(ClientTimerReason::ResponseTimeout { op: ClientOp::Put, key: key.clone() }),
        );
        if timer.is_some() {
            history.record(Tag::Start, Event::Timer { node: self_id, reason: "client_put_timeout" });
        }
        self.ensure(self_id).outstanding.insert(
            (ClientOp::Put, key),
            PendingRequest { value: Some(value), metadata, timer },
        );
    }

    #[allow(clippy::too_many_arguments)]
    pub fn get<R: Rng>(
        &mut self,
        self_id: NodeId,
        key: Key,
        destnode: Option<NodeId>,
        nodes: &NodeTable,
        scheduler: &mut Scheduler,
        timers: &mut ClientTimers,
        history: &mut History,
        params: &DynamoParams,
        rng: &mut R,
    ) {
        let Some(target) = destnode.or_else(|| pick_replica(nodes, rng)) else {
            tracing::warn!(node = %self_id, "no replica available to receive get");
            return;
        };
        scheduler.send(
            Message::from(ClientGet { from: self_id, to: target, key: key.clone() }),
            history,
        );
        let timer = timers.start(
            self_id,
            nodes.is_failed(self_id),
            params.client_timer_priority,
            TimerReason::Client(ClientTimerReason::ResponseTimeout { op: ClientOp::Get, key: key.clone() }),
        );
        if timer.is_some() {
            history.record(Tag::Start, Event::Timer { node: self_id, reason: "client_get_timeout" });
        }
        self.ensure(self_id)
            .outstanding
            .insert((ClientOp::Get, key), PendingRequest { value: None, metadata: Clock::None, timer });
    }

    pub fn on_client_put_rsp(&mut self, self_id: NodeId, msg: ClientPutRsp, timers: &mut ClientTimers, history: &mut History) {
        let state = self.ensure(self_id);
        if let Some(pending) = state.outstanding.remove(&(ClientOp::Put, msg.key.clone())) {
            if let Some(handle) = pending.timer {
                timers.cancel(handle);
                history.record(Tag::Cancel, Event::Timer { node: self_id, reason: "client_put_timeout" });
            }
        }
        state.last_put = Some(msg);
    }

    pub fn on_client_get_rsp(&mut self, self_id: NodeId, msg: ClientGetRsp, timers: &mut ClientTimers, history: &mut History) {
        let state = self.ensure(self_id);
        if let Some(pending) = state.outstanding.remove(&(ClientOp::Get, msg.key.clone())) {
            if let Some(handle) = pending.timer {
                timers.cancel(handle);
                history.record(Tag::Cancel, Event::Timer { node: self_id, reason: "client_get_timeout" });
            }
        }
        state.last_get = Some(msg);
    }

    /// A response timeout fired before quorum was reached: reissue the same
    /// request, possibly to a different randomly chosen replica.
    #[allow(clippy::too_many_arguments)]
    pub fn on_timer<R: Rng>(
        &mut self,
        self_id: NodeId,
        reason: ClientTimerReason,
        nodes: &NodeTable,
        scheduler: &mut Scheduler,
        timers: &mut ClientTimers,
        history: &mut History,
        params: &DynamoParams,
        rng: &mut R,
    ) {
        let ClientTimerReason::ResponseTimeout { op, key } = reason;
        let Some(pending) = self.ensure(self_id).outstanding.remove(&(op, key.clone())) else {
            return;
        };
        // A retry always picks a fresh random destination, even when the
        // original call pinned one.
        match op {
            ClientOp::Put => {
                let value = pending.value.expect("put retries always carry a value");
                self.put(self_id, key, value, pending.metadata, None, nodes, scheduler, timers, history, params, rng);
            }
            ClientOp::Get => {
                self.get(self_id, key, None, nodes, scheduler, timers, history, params, rng);
            }
        }
    }
}

fn pick_replica<R: Rng>(nodes: &NodeTable, rng: &mut R) -> Option<NodeId> {
    let candidates = nodes.included_replicas();
    if candidates.is_empty() {
        return None;
    }
    let index = rng.gen_range(0..candidates.len());
    Some(candidates[index])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::History;
    use crate::node::{NodeKind, NodeTable};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn put_then_response_clears_outstanding_and_records_result() {
        let mut nodes = NodeTable::new();
        let replica = nodes.create(NodeKind::Replica, None);
        let client = nodes.create(NodeKind::Client, None);
        let mut scheduler = Scheduler::new();
        let mut timers: ClientTimers = ClientTimers::new();
        let mut history = History::new();
        let params = DynamoParams::default();
        let mut rng = StdRng::seed_from_u64(1);
        let mut clients = Clients::new();

        clients.put(client, "k".into(), Value::from(1), Clock::None, Some(replica), &nodes, &mut scheduler, &mut timers, &mut history, &params, &mut rng);
        assert!(clients.last_put(client).is_none());

        clients.on_client_put_rsp(
            client,
            ClientPutRsp { from: replica, to: client, key: "k".into(), value: Value::from(1), metadata: crate::clock::VectorClock::new() },
            &mut timers,
            &mut history,
        );
        assert!(clients.last_put(client).is_some());
    }

    #[test]
    fn timeout_reissues_to_a_freshly_chosen_destination() {
        let mut nodes = NodeTable::new();
        let replica = nodes.create(NodeKind::Replica, None);
        let client = nodes.create(NodeKind::Client, None);
        let mut scheduler = Scheduler::new();
        let mut timers: ClientTimers = ClientTimers::new();
        let mut history = History::new();
        let params = DynamoParams::default();
        let mut rng = StdRng::seed_from_u64(7);
        let mut clients = Clients::new();

        clients.get(client, "k".into(), Some(replica), &nodes, &mut scheduler, &mut timers, &mut history, &params, &mut rng);
        assert_eq!(scheduler.pending_count(), 1);

        clients.on_timer(client, ClientTimerReason::ResponseTimeout { op: ClientOp::Get, key: "k".into() }, &nodes, &mut scheduler, &mut timers, &mut history, &params, &mut rng);
        assert_eq!(scheduler.pending_count(), 2);
    }
}
