//! Replica-side protocol state machine: coordinating puts/gets, hinted
//! handoff, and ping-driven failure recovery.
//!
//! Every included replica can act as coordinator for any key whose
//! preference list it belongs to; there is no distinguished "coordinator
//! node" type, and the coordinator counts itself as one of the `W`/`R`
//! replicas only by sending itself a `PutReq`/`GetReq` like any other
//! replica, never by a separate local-store fast path.

use std::collections::{HashMap, HashSet};

use crate::clock::VectorClock;
use crate::config::DynamoParams;
use crate::error::DynamoError;
use crate::history::{Event, History, Tag};
use crate::message::{
    ClientGetRsp, ClientPutRsp, GetReq, GetRsp, Key, Message, PingReq, PingRsp, PutReq, PutRsp, Value,
};
use crate::node::{NodeId, NodeTable};
use crate::reason::{ReplicaTimerReason, SimTimers, TimerReason};
use crate::ring::Ring;
use crate::scheduler::Scheduler;

pub type ReplicaTimers = SimTimers;

#[derive(Debug, Default)]
struct PendingPut {
    client: NodeId,
    key: Key,
    value: Value,
    metadata: VectorClock,
    acked: HashSet<NodeId>,
    replied: bool,
    tried: HashSet<NodeId>,
    outstanding: HashMap<NodeId, crate::timer::TimerHandle>,
}

#[derive(Debug, Default)]
struct PendingGet {
    client: NodeId,
    key: Key,
    replied_from: HashSet<NodeId>,
    collected: Vec<(Value, VectorClock)>,
    replied: bool,
    tried: HashSet<NodeId>,
    outstanding: HashMap<NodeId, crate::timer::TimerHandle>,
}

#[derive(Debug, Default)]
struct ReplicaState {
    store: HashMap<Key, Vec<(Value, VectorClock)>>,
    pending_puts: HashMap<u64, PendingPut>,
    pending_gets: HashMap<u64, PendingGet>,
    /// Versions this node holds on behalf of a currently-unreachable
    /// original replica, keyed by that replica's id.
    pending_handoffs: HashMap<NodeId, Vec<(Key, Value, VectorClock)>>,
    /// Nodes this replica is currently pinging to detect recovery, with the
    /// handle of the next scheduled retry.
    watching: HashMap<NodeId, crate::timer::TimerHandle>,
    /// Replicas this coordinator has itself seen time out on some past
    /// request. Consulted, alongside the in-flight request's own `tried`
    /// set, when picking the next surrogate on a fresh timeout, and exposed
    /// to callers/tests via `Replicas::failed_nodes`.
    failed_nodes: HashSet<NodeId>,
}

/// Merge a newly observed `(value, clock)` into a node's local sibling set
/// for one key, dropping anything the new write supersedes and discarding
/// the new write if some existing sibling already supersedes it.
fn merge_version(siblings: &mut Vec<(Value, VectorClock)>, value: Value, clock: VectorClock) {
    if siblings.iter().any(|(_, c)| clock <= *c) {
        return;
    }
    siblings.retain(|(_, c)| !(*c <= clock));
    siblings.push((value, clock));
}

/// Per-node protocol state for every replica in a simulation.
#[derive(Debug, Default)]
pub struct Replicas {
    states: HashMap<NodeId, ReplicaState>,
}

impl Replicas {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure(&mut self, id: NodeId) -> &mut ReplicaState {
        self.states.entry(id).or_default()
    }

    /// Snapshot of the sibling set currently stored for `key` at `id`, for
    /// tests and diagnostics.
    pub fn stored(&self, id: NodeId, key: &str) -> Vec<(Value, VectorClock)> {
        self.states
            .get(&id)
            .and_then(|s| s.store.get(key))
            .cloned()
            .unwrap_or_default()
    }

    /// Replicas this coordinator has itself observed timing out, across all
    /// requests it has coordinated.
    pub fn failed_nodes(&self, id: NodeId) -> HashSet<NodeId> {
        self.states.get(&id).map(|s| s.failed_nodes.clone()).unwrap_or_default()
    }

    /// Cheap content fingerprint for a replica's local store: XOR-fold a
    /// ring token per `(key, sibling)` pair, order-independent so two
    /// replicas holding the same versions agree regardless of insertion
    /// order. Stands in for a real Merkle tree.
    pub fn fingerprint(&self, id: NodeId) -> u64 {
        let Some(state) = self.states.get(&id) else {
            return 0;
        };
        let mut acc: u64 = 0;
        for (key, siblings) in &state.store {
            for (value, clock) in siblings {
                let token = crate::hash::ring_token(&format!("{key}:{value}:{clock:?}"));
                acc ^= token as u64;
            }
        }
        acc
    }

    /// Errs with `UnknownMessage` for the two variants a replica can never
    /// legitimately receive, rather than silently ignoring them -- callers
    /// `.expect()` this, since it can only fire from a dispatch-wiring bug,
    /// not from any reachable protocol state.
    pub fn dispatch(
        &mut self,
        self_id: NodeId,
        msg: Message,
        ring: &Ring,
        nodes: &mut NodeTable,
        scheduler: &mut Scheduler,
        timers: &mut ReplicaTimers,
        history: &mut History,
        params: &DynamoParams,
    ) -> Result<(), DynamoError> {
        match msg {
            Message::ClientPut(m) => {
                self.on_client_put(self_id, m.key, m.value, m.metadata.into_clocks(), m.from, ring, nodes, scheduler, timers, history, params)
            }
            Message::PutReq(m) => self.on_put_req(self_id, m, nodes, scheduler, timers, history, params),
            Message::PutRsp(m) => self.on_put_rsp(self_id, m, timers, scheduler, history, params),
            Message::ClientGet(m) => {
                self.on_client_get(self_id, m.key, m.from, ring, nodes, scheduler, timers, history, params)
            }
            Message::GetReq(m) => self.on_get_req(self_id, m, scheduler, history),
            Message::GetRsp(m) => self.on_get_rsp(self_id, m, timers, scheduler, history, params),
            Message::PingReq(m) => self.on_ping_req(self_id, m, scheduler, history),
            Message::PingRsp(m) => self.on_ping_rsp(self_id, m, nodes, timers, scheduler, history, params),
            Message::ClientPutRsp(_) | Message::ClientGetRsp(_) => {
                return Err(DynamoError::UnknownMessage { at: format!("replica {self_id}") });
            }
        }
        Ok(())
    }

    /// A response timeout is a node-level signal, not a per-request one:
    /// once `target` is believed down, every other request this coordinator
    /// has outstanding to `target` is cancelled and retried in the same
    /// pass, mirroring the cascading failover `Framework.cancel_timers_to`
    /// drives in the grounded original.
    pub fn on_timer(
        &mut self,
        self_id: NodeId,
        reason: ReplicaTimerReason,
        ring: &Ring,
        nodes: &mut NodeTable,
        scheduler: &mut Scheduler,
        timers: &mut ReplicaTimers,
        history: &mut History,
        params: &DynamoParams,
    ) {
        match reason {
            ReplicaTimerReason::PutTimeout { target, .. } | ReplicaTimerReason::GetTimeout { target, .. } => {
                self.on_response_timeout(self_id, target, ring, nodes, scheduler, timers, history, params)
            }
            ReplicaTimerReason::PingRetry { target } => {
                self.on_ping_retry(self_id, target, nodes, scheduler, timers, history, params)
            }
        }
    }

    /// Cancel and retry every request this coordinator has outstanding to
    /// `target`, of either kind, not just the one whose timer happened to
    /// pop first.
    #[allow(clippy::too_many_arguments)]
    fn on_response_timeout(
        &mut self,
        self_id: NodeId,
        target: NodeId,
        ring: &Ring,
        nodes: &NodeTable,
        scheduler: &mut Scheduler,
        timers: &mut ReplicaTimers,
        history: &mut History,
        params: &DynamoParams,
    ) {
        let state = self.ensure(self_id);
        state.failed_nodes.insert(target);
        let put_ids: Vec<u64> = state
            .pending_puts
            .iter()
            .filter(|(_, p)| p.outstanding.contains_key(&target))
            .map(|(id, _)| *id)
            .collect();
        let get_ids: Vec<u64> = state
            .pending_gets
            .iter()
            .filter(|(_, g)| g.outstanding.contains_key(&target))
            .map(|(id, _)| *id)
            .collect();

        for put_id in put_ids {
            self.on_put_timeout(self_id, put_id, target, ring, nodes, scheduler, timers, history, params);
        }
        for get_id in get_ids {
            self.on_get_timeout(self_id, get_id, target, ring, nodes, scheduler, timers, history, params);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_client_put(
        &mut self,
        self_id: NodeId,
        key: Key,
        value: Value,
        incoming: Vec<VectorClock>,
        client: NodeId,
        ring: &Ring,
        nodes: &mut NodeTable,
        scheduler: &mut Scheduler,
        timers: &mut ReplicaTimers,
        history: &mut History,
        params: &DynamoParams,
    ) {
        let failed_nodes: Vec<NodeId> = self.failed_nodes(self_id).into_iter().collect();
        let (preflist, mut avoided) = ring.find_nodes(&key, params.n, &failed_nodes);
        if preflist.is_empty() {
            tracing::warn!(node = %self_id, %key, "no replicas available for key");
            return;
        }
        if !preflist.contains(&self_id) {
            let forward = Message::from(crate::message::ClientPut {
                from: client,
                to: preflist[0],
                key,
                value,
                metadata: crate::clock::Clock::Many(incoming),
            });
            scheduler.forward(forward, history);
            return;
        }
        // Only the first N avoided nodes are part of the original
        // preference list this put maps to; anything beyond that was
        // stepped over incidentally and is not this put's concern.
        avoided.truncate(params.n);
        let non_extra_count = params.n.saturating_sub(avoided.len());

        let coalesced = VectorClock::coalesce(incoming);
        let mut metadata = VectorClock::converge(coalesced);
        let name = nodes.name(self_id).to_string();
        let seqno = nodes.next_seq(self_id);
        metadata
            .update(name, seqno)
            .expect("next_seq is strictly greater than anything this node has stamped before");
        let put_id = seqno;
        let mut pending = PendingPut {
            client,
            key: key.clone(),
            value: value.clone(),
            metadata: metadata.clone(),
            tried: preflist.iter().copied().collect(),
            ..Default::default()
        };
        for (i, target) in preflist.iter().enumerate() {
            let handoff: &[NodeId] = if i >= non_extra_count { &avoided } else { &[] };
            issue_put_request(self_id, put_id, *target, &key, &value, &metadata, handoff, nodes, scheduler, timers, history, params, &mut pending);
        }
        self.ensure(self_id).pending_puts.insert(put_id, pending);
    }

    #[allow(clippy::too_many_arguments)]
    fn on_put_req(
        &mut self,
        self_id: NodeId,
        msg: PutReq,
        nodes: &NodeTable,
        scheduler: &mut Scheduler,
        timers: &mut ReplicaTimers,
        history: &mut History,
        params: &DynamoParams,
    ) {
        let handoff = msg.handoff.clone();
        let state = self.ensure(self_id);
        let siblings = state.store.entry(msg.key.clone()).or_default();
        merge_version(siblings, msg.value.clone(), msg.metadata.clone());

        scheduler.send(
            Message::from(PutRsp {
                from: self_id,
                to: msg.from,
                msg_id: msg.msg_id,
                key: msg.key.clone(),
                value: msg.value.clone(),
            }),
            history,
        );

        for original in handoff {
            let state = self.ensure(self_id);
            state
                .pending_handoffs
                .entry(original)
                .or_default()
                .push((msg.key.clone(), msg.value.clone(), msg.metadata.clone()));
            start_watching(self.ensure(self_id), self_id, original, nodes, scheduler, timers, history, params);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_put_rsp(
        &mut self,
        self_id: NodeId,
        msg: PutRsp,
        timers: &mut ReplicaTimers,
        scheduler: &mut Scheduler,
        history: &mut History,
        params: &DynamoParams,
    ) {
        let state = self.ensure(self_id);
        let Some(pending) = state.pending_puts.get_mut(&msg.msg_id) else {
            return;
        };
        if let Some(handle) = pending.outstanding.remove(&msg.from) {
            timers.cancel(handle);
            history.record(Tag::Cancel, Event::Timer { node: self_id, reason: "put_timeout" });
        }
        pending.acked.insert(msg.from);
        if !pending.replied && pending.acked.len() >= params.w {
            pending.replied = true;
            scheduler.send(
                Message::from(ClientPutRsp {
                    from: self_id,
                    to: pending.client,
                    key: pending.key.clone(),
                    value: pending.value.clone(),
                    metadata: pending.metadata.clone(),
                }),
                history,
            );
        }
        if pending.outstanding.is_empty() {
            state.pending_puts.remove(&msg.msg_id);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_put_timeout(
        &mut self,
        self_id: NodeId,
        put_id: u64,
        target: NodeId,
        ring: &Ring,
        nodes: &NodeTable,
        scheduler: &mut Scheduler,
        timers: &mut ReplicaTimers,
        history: &mut History,
        params: &DynamoParams,
    ) {
        let state = self.ensure(self_id);
        let Some(pending) = state.pending_puts.get_mut(&put_id) else {
            return;
        };
        if let Some(handle) = pending.outstanding.remove(&target) {
            timers.cancel(handle);
            history.record(Tag::Cancel, Event::Timer { node: self_id, reason: "put_timeout" });
        }
        if pending.acked.contains(&target) {
            if pending.outstanding.is_empty() {
                state.pending_puts.remove(&put_id);
            }
            return;
        }
        let avoid: Vec<NodeId> = pending.tried.union(&state.failed_nodes).copied().collect();
        let (surrogate, _) = ring.find_nodes(&pending.key, 1, &avoid);
        if let Some(surrogate) = surrogate.first().copied() {
            pending.tried.insert(surrogate);
            let key = pending.key.clone();
            let value = pending.value.clone();
            let metadata = pending.metadata.clone();
            issue_put_request(self_id, put_id, surrogate, &key, &value, &metadata, &[target], nodes, scheduler, timers, history, params, pending);
        } else {
            tracing::warn!(node = %self_id, %target, "no surrogate available for hinted handoff");
        }
        if pending.outstanding.is_empty() {
            state.pending_puts.remove(&put_id);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_client_get(
        &mut self,
        self_id: NodeId,
        key: Key,
        client: NodeId,
        ring: &Ring,
        nodes: &mut NodeTable,
        scheduler: &mut Scheduler,
        timers: &mut ReplicaTimers,
        history: &mut History,
        params: &DynamoParams,
    ) {
        let failed_nodes: Vec<NodeId> = self.failed_nodes(self_id).into_iter().collect();
        let (preflist, _) = ring.find_nodes(&key, params.n, &failed_nodes);
        if preflist.is_empty() {
            tracing::warn!(node = %self_id, %key, "no replicas available for key");
            return;
        }
        if !preflist.contains(&self_id) {
            let forward = Message::from(crate::message::ClientGet {
                from: client,
                to: preflist[0],
                key,
            });
            scheduler.forward(forward, history);
            return;
        }

        let get_id = nodes.next_seq(self_id);
        let mut pending = PendingGet {
            client,
            key: key.clone(),
            tried: preflist.iter().copied().collect(),
            ..Default::default()
        };
        for target in &preflist {
            issue_get_request(self_id, get_id, *target, &key, nodes, scheduler, timers, history, params, &mut pending);
        }
        self.ensure(self_id).pending_gets.insert(get_id, pending);
    }

    fn on_get_req(&mut self, self_id: NodeId, msg: GetReq, scheduler: &mut Scheduler, history: &mut History) {
        let state = self.ensure(self_id);
        let siblings = state.store.get(&msg.key).cloned().unwrap_or_default();
        if siblings.is_empty() {
            scheduler.send(
                Message::from(GetRsp {
                    from: self_id,
                    to: msg.from,
                    msg_id: msg.msg_id,
                    key: msg.key.clone(),
                    value: None,
                    clock: None,
                }),
                history,
            );
            return;
        }
        for (value, clock) in siblings {
            scheduler.send(
                Message::from(GetRsp {
                    from: self_id,
                    to: msg.from,
                    msg_id: msg.msg_id,
                    key: msg.key.clone(),
                    value: Some(value),
                    clock: Some(clock),
                }),
                history,
            );
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_get_rsp(
        &mut self,
        self_id: NodeId,
        msg: GetRsp,
        timers: &mut ReplicaTimers,
        scheduler: &mut Scheduler,
        history: &mut History,
        params: &DynamoParams,
    ) {
        let state = self.ensure(self_id);
        let Some(pending) = state.pending_gets.get_mut(&msg.msg_id) else {
            return;
        };
        if !pending.replied_from.contains(&msg.from) {
            pending.replied_from.insert(msg.from);
            if let Some(handle) = pending.outstanding.remove(&msg.from) {
                timers.cancel(handle);
                history.record(Tag::Cancel, Event::Timer { node: self_id, reason: "get_timeout" });
            }
        }
        if let (Some(value), Some(clock)) = (msg.value, msg.clock) {
            merge_version(&mut pending.collected, value, clock);
        }
        if !pending.replied && pending.replied_from.len() >= params.r {
            pending.replied = true;
            let (values, clocks) = pending.collected.iter().cloned().unzip();
            scheduler.send(
                Message::from(ClientGetRsp {
                    from: self_id,
                    to: pending.client,
                    key: pending.key.clone(),
                    values,
                    clocks,
                }),
                history,
            );
        }
        if pending.outstanding.is_empty() {
            state.pending_gets.remove(&msg.msg_id);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_get_timeout(
        &mut self,
        self_id: NodeId,
        get_id: u64,
        target: NodeId,
        ring: &Ring,
        nodes: &NodeTable,
        scheduler: &mut Scheduler,
        timers: &mut ReplicaTimers,
        history: &mut History,
        params: &DynamoParams,
    ) {
        let state = self.ensure(self_id);
        let Some(pending) = state.pending_gets.get_mut(&get_id) else {
            return;
        };
        if let Some(handle) = pending.outstanding.remove(&target) {
            timers.cancel(handle);
            history.record(Tag::Cancel, Event::Timer { node: self_id, reason: "get_timeout" });
        }
        if pending.replied_from.contains(&target) {
            if pending.outstanding.is_empty() {
                state.pending_gets.remove(&get_id);
            }
            return;
        }
        let avoid: Vec<NodeId> = pending.tried.union(&state.failed_nodes).copied().collect();
        let (surrogate, _) = ring.find_nodes(&pending.key, 1, &avoid);
        if let Some(surrogate) = surrogate.first().copied() {
            pending.tried.insert(surrogate);
            let key = pending.key.clone();
            issue_get_request(self_id, get_id, surrogate, &key, nodes, scheduler, timers, history, params, pending);
        } else {
            tracing::warn!(node = %self_id, %target, "no surrogate available to retry read");
        }
        if pending.outstanding.is_empty() {
            state.pending_gets.remove(&get_id);
        }
    }

    fn on_ping_req(&mut self, self_id: NodeId, msg: PingReq, scheduler: &mut Scheduler, history: &mut History) {
        scheduler.send(Message::from(PingRsp { from: self_id, to: msg.from }), history);
    }

    #[allow(clippy::too_many_arguments)]
    fn on_ping_rsp(
        &mut self,
        self_id: NodeId,
        msg: PingRsp,
        nodes: &mut NodeTable,
        timers: &mut ReplicaTimers,
        scheduler: &mut Scheduler,
        history: &mut History,
        params: &DynamoParams,
    ) {
        let _ = params;
        let state = self.ensure(self_id);
        if let Some(handle) = state.watching.remove(&msg.from) {
            timers.cancel(handle);
            history.record(Tag::Cancel, Event::Timer { node: self_id, reason: "ping_retry" });
        }
        let Some(hints) = state.pending_handoffs.remove(&msg.from) else {
            return;
        };
        // The replica originates this write itself -- it is not relaying
        // anyone else's request -- so it goes out via `send`, not `forward`.
        for (key, value, clock) in hints {
            let msg_id = nodes.next_seq(self_id);
            scheduler.send(
                Message::from(PutReq {
                    from: self_id,
                    to: msg.from,
                    msg_id,
                    key,
                    value,
                    metadata: clock,
                    handoff: Vec::new(),
                }),
                history,
            );
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_ping_retry(
        &mut self,
        self_id: NodeId,
        target: NodeId,
        nodes: &NodeTable,
        scheduler: &mut Scheduler,
        timers: &mut ReplicaTimers,
        history: &mut History,
        params: &DynamoParams,
    ) {
        let state = self.ensure(self_id);
        if !state.pending_handoffs.contains_key(&target) {
            return;
        }
        scheduler.send(Message::from(PingReq { from: self_id, to: target }), history);
        if let Some(handle) = timers.start(self_id, nodes.is_failed(self_id), params.ping_timer_priority, TimerReason::Replica(ReplicaTimerReason::PingRetry { target })) {
            history.record(Tag::Start, Event::Timer { node: self_id, reason: "ping_retry" });
            state.watching.insert(target, handle);
        }
    }
}

fn start_watching(
    state: &mut ReplicaState,
    self_id: NodeId,
    target: NodeId,
    nodes: &NodeTable,
    scheduler: &mut Scheduler,
    timers: &mut ReplicaTimers,
    history: &mut History,
    params: &DynamoParams,
) {
    if state.watching.contains_key(&target) {
        return;
    }
    scheduler.send(Message::from(PingReq { from: self_id, to: target }), history);
    if let Some(handle) = timers.start(self_id, nodes.is_failed(self_id), params.ping_timer_priority, TimerReason::Replica(ReplicaTimerReason::PingRetry { target })) {
        history.record(Tag::Start, Event::Timer { node: self_id, reason: "ping_retry" });
        state.watching.insert(target, handle);
    }
}

#[allow(clippy::too_many_arguments)]
fn issue_put_request(
    self_id: NodeId,
    put_id: u64,
    target: NodeId,
    key: &Key,
    value: &Value,
    metadata: &VectorClock,
    handoff: &[NodeId],
    nodes: &NodeTable,
    scheduler: &mut Scheduler,
    timers: &mut ReplicaTimers,
    history: &mut History,
    params: &DynamoParams,
    pending: &mut PendingPut,
) {
    scheduler.send(
        Message::from(PutReq {
            from: self_id,
            to: target,
            msg_id: put_id,
            key: key.clone(),
            value: value.clone(),
            metadata: metadata.clone(),
            handoff: handoff.to_vec(),
        }),
        history,
    );
    if let Some(handle) = timers.start(self_id, nodes.is_failed(self_id), params.coordinator_timer_priority, TimerReason::Replica(ReplicaTimerReason::PutTimeout { put_id, target })) {
        history.record(Tag::Start, Event::Timer { node: self_id, reason: "put_timeout" });
        pending.outstanding.insert(target, handle);
    }
}

#[allow(clippy::too_many_arguments)]
fn issue_get_request(
    self_id: NodeId,
    get_id: u64,
    target: NodeId,
    key: &Key,
    nodes: &NodeTable,
    scheduler: &mut Scheduler,
    timers: &mut ReplicaTimers,
    history: &mut History,
    params: &DynamoParams,
    pending: &mut PendingGet,
) {
    scheduler.send(
        Message::from(GetReq {
            from: self_id,
            to: target,
            msg_id: get_id,
            key: key.clone(),
        }),
        history,
    );
    if let Some(handle) = timers.start(self_id, nodes.is_failed(self_id), params.coordinator_timer_priority, TimerReason::Replica(ReplicaTimerReason::GetTimeout { get_id, target })) {
        history.record(Tag::Start, Event::Timer { node: self_id, reason: "get_timeout" });
        pending.outstanding.insert(target, handle);
    }
}
