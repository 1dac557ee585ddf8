//! Simulation façade. Every other module in this crate is pure state plus
//! free functions operating on borrowed pieces of it; this is the one place
//! that owns all of them together and drives the drain loop.

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::client::{ClientTimers, Clients};
use crate::clock::{Clock, VectorClock};
use crate::config::DynamoParams;
use crate::coordinator::{ReplicaTimers, Replicas};
use crate::error::DynamoError;
use crate::history::{Event, History, Tag};
use crate::message::{ClientGetRsp, ClientPutRsp, Key, Message, Value};
use crate::node::{NodeId, NodeKind, NodeTable};
use crate::reason::{ClientOp, ClientTimerReason, ReplicaTimerReason, TimerReason};
use crate::ring::Ring;
use crate::scheduler::Scheduler;

/// Owns every piece of mutable state a run touches. Constructed fresh per
/// test rather than reset via module-level globals, since there is no
/// remaining process-wide state to reset.
pub struct Simulation {
    nodes: NodeTable,
    ring: Ring,
    history: History,
    scheduler: Scheduler,
    timers: ReplicaTimers,
    replicas: Replicas,
    clients: Clients,
    params: DynamoParams,
    rng: StdRng,
}

impl Simulation {
    pub fn new(params: DynamoParams, seed: u64) -> Self {
        Self {
            nodes: NodeTable::new(),
            ring: Ring::new(),
            history: History::new(),
            scheduler: Scheduler::new(),
            timers: ReplicaTimers::new(),
            replicas: Replicas::new(),
            clients: Clients::new(),
            params,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Start over with the same tunables and a fresh seed, matching the
    /// external interface's `ring.reset()` / `Node.reset()` /
    /// `framework.reset()` trio collapsed into one call.
    pub fn reset(&mut self, seed: u64) {
        *self = Self::new(self.params, seed);
    }

    /// Preference list for `key` under the current live-node set, for tests
    /// that need to pin specific replicas before failing them.
    pub fn preference_list(&self, key: &str) -> Vec<NodeId> {
        self.ring.find_nodes(key, self.params.n, &[]).0
    }

    /// Full clockwise replica ordering for `key`, beyond the `N`-length
    /// preference list, so tests can name the surrogates (`P[3]`, `P[4]`, ...)
    /// a coordinator would fail over to.
    pub fn full_ring_order(&self, key: &str) -> Vec<NodeId> {
        let total = self.nodes.included_replicas().len();
        self.ring.find_nodes(key, total, &[]).0
    }

    pub fn params(&self) -> &DynamoParams {
        &self.params
    }

    pub fn add_node(&mut self, name: Option<String>) -> NodeId {
        let id = self.nodes.create(NodeKind::Replica, name);
        self.history.record(Tag::Add, Event::Node(id));
        tracing::debug!(node = %id, "node added");
        self.rebuild_ring();
        id
    }

    pub fn add_client(&mut self, name: Option<String>) -> NodeId {
        let id = self.nodes.create(NodeKind::Client, name);
        self.history.record(Tag::Add, Event::Node(id));
        tracing::debug!(node = %id, "client added");
        id
    }

    fn rebuild_ring(&mut self) {
        self.ring.rebuild(&self.nodes, self.params.virtual_nodes);
    }

    pub fn fail(&mut self, id: NodeId) {
        self.nodes.fail(id);
        self.history.record(Tag::Fail, Event::Node(id));
        tracing::debug!(node = %id, "node failed");
    }

    pub fn recover(&mut self, id: NodeId) {
        self.nodes.recover(id);
        self.history.record(Tag::Recover, Event::Node(id));
        tracing::debug!(node = %id, "node recovered");
    }

    /// Remove a node from the ring entirely, purging any timers it still
    /// owns so a dead node can never fire one -- the same guarantee failed
    /// nodes get, extended to removal.
    pub fn remove(&mut self, id: NodeId) {
        self.nodes.remove(id);
        self.history.record(Tag::Remove, Event::Node(id));
        let purged = self.timers.cancel_owned_by(id);
        if purged > 0 {
            self.history.record(
                Tag::Announce,
                Event::Note(format!("purged {purged} pending timer(s) for removed node {id}")),
            );
        }
        self.rebuild_ring();
    }

    pub fn restore(&mut self, id: NodeId) {
        self.nodes.restore(id);
        self.history.record(Tag::Announce, Event::Note(format!("restored node {id}")));
        self.rebuild_ring();
    }

    pub fn cut_wires(&mut self, from: NodeId, to: NodeId) {
        self.scheduler.cut_wires(from, to, &mut self.history);
    }

    pub fn restore_wires(&mut self, from: NodeId, to: NodeId) {
        self.scheduler.restore_wires(from, to, &mut self.history);
    }

    pub fn put(&mut self, client: NodeId, key: Key, metadata: Clock, value: Value, destnode: Option<NodeId>) {
        self.clients.put(
            client,
            key,
            value,
            metadata,
            destnode,
            &self.nodes,
            &mut self.scheduler,
            &mut self.timers,
            &mut self.history,
            &self.params,
            &mut self.rng,
        );
    }

    pub fn get(&mut self, client: NodeId, key: Key, destnode: Option<NodeId>) {
        self.clients.get(
            client,
            key,
            destnode,
            &self.nodes,
            &mut self.scheduler,
            &mut self.timers,
            &mut self.history,
            &self.params,
            &mut self.rng,
        );
    }

    pub fn last_put(&self, client: NodeId) -> Option<&ClientPutRsp> {
        self.clients.last_put(client)
    }

    pub fn last_get(&self, client: NodeId) -> Option<&ClientGetRsp> {
        self.clients.last_get(client)
    }

    /// Snapshot of the sibling set a replica currently holds for `key`, for
    /// assertions in tests.
    pub fn stored(&self, id: NodeId, key: &str) -> Vec<(Value, VectorClock)> {
        self.replicas.stored(id, key)
    }

    pub fn fingerprint(&self, id: NodeId) -> u64 {
        self.replicas.fingerprint(id)
    }

    /// Replicas `id` has itself observed timing out while coordinating some
    /// request.
    pub fn failed_nodes_known_to(&self, id: NodeId) -> std::collections::HashSet<NodeId> {
        self.replicas.failed_nodes(id)
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn node_name(&self, id: NodeId) -> &str {
        self.nodes.name(id)
    }

    pub fn pending_messages(&self) -> usize {
        self.scheduler.pending_count()
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.pending_count()
    }

    /// Drain messages and timers until both are empty or `max_events`
    /// dispatches have happened. A deliverable message always takes
    /// priority over popping a timer, so timeouts only fire once a step
    /// produces no further messages: the core loop here prefers
    /// `Scheduler::pop_message` and falls back to `TimerManager::pop`.
    pub fn schedule(&mut self, max_events: usize) -> usize {
        let mut dispatched = 0;
        while dispatched < max_events {
            if let Some(msg) = self.scheduler.pop_message(|id| self.nodes.is_failed(id), &mut self.history) {
                self.dispatch_message(msg);
                dispatched += 1;
                continue;
            }
            let nodes = &self.nodes;
            let Some((owner, reason)) = self.timers.pop(|id| nodes.is_failed(id)) else {
                break;
            };
            self.history.record(Tag::Pop, Event::Timer { node: owner, reason: reason_label(&reason) });
            self.dispatch_timer(owner, reason);
            dispatched += 1;
        }
        dispatched
    }

    fn dispatch_message(&mut self, msg: Message) {
        let to = msg.to_node();
        let kind = self.nodes.get(to).kind;
        match kind {
            NodeKind::Replica => self
                .replicas
                .dispatch(
                    to,
                    msg,
                    &self.ring,
                    &mut self.nodes,
                    &mut self.scheduler,
                    &mut self.timers,
                    &mut self.history,
                    &self.params,
                )
                .expect("replica dispatch only reaches messages addressed to a replica"),
            NodeKind::Client => match msg {
                Message::ClientPutRsp(m) => self.clients.on_client_put_rsp(to, m, &mut self.timers, &mut self.history),
                Message::ClientGetRsp(m) => self.clients.on_client_get_rsp(to, m, &mut self.timers, &mut self.history),
                other => panic!(
                    "{}",
                    DynamoError::UnknownMessage { at: format!("client {to} ({})", other.kind()) }
                ),
            },
        }
    }

    fn dispatch_timer(&mut self, owner: NodeId, reason: TimerReason) {
        match reason {
            TimerReason::Replica(r) => self.replicas.on_timer(
                owner,
                r,
                &self.ring,
                &mut self.nodes,
                &mut self.scheduler,
                &mut self.timers,
                &mut self.history,
                &self.params,
            ),
            TimerReason::Client(r) => self.clients.on_timer(
                owner,
                r,
                &self.nodes,
                &mut self.scheduler,
                &mut self.timers,
                &mut self.history,
                &self.params,
                &mut self.rng,
            ),
        }
    }
}

fn reason_label(reason: &TimerReason) -> &'static str {
    match reason {
        TimerReason::Replica(ReplicaTimerReason::PutTimeout { .. }) => "put_timeout",
        TimerReason::Replica(ReplicaTimerReason::GetTimeout { .. }) => "get_timeout",
        TimerReason::Replica(ReplicaTimerReason::PingRetry { .. }) => "ping_retry",
        TimerReason::Client(ClientTimerReason::ResponseTimeout { op: ClientOp::Put, .. }) => "client_put_timeout",
        TimerReason::Client(ClientTimerReason::ResponseTimeout { op: ClientOp::Get, .. }) => "client_get_timeout",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Simulation, Vec<NodeId>, NodeId) {
        let mut sim = Simulation::new(DynamoParams::default(), 0);
        let nodes: Vec<_> = (0..6).map(|_| sim.add_node(None)).collect();
        let client = sim.add_client(None);
        (sim, nodes, client)
    }

    #[test]
    fn simple_put_reaches_write_quorum_with_no_drops_or_cuts() {
        let (mut sim, _nodes, client) = setup();
        sim.put(client, "K1".into(), Clock::None, Value::from(1), None);
        sim.schedule(1000);
        assert!(sim.last_put(client).is_some());
        assert_eq!(sim.history().count(Tag::Drop), 0);
        assert_eq!(sim.history().count(Tag::Cut), 0);
    }

    #[test]
    fn get_after_put_returns_the_written_value() {
        let (mut sim, _nodes, client) = setup();
        sim.put(client, "K1".into(), Clock::None, Value::from(1), None);
        sim.schedule(1000);
        sim.get(client, "K1".into(), None);
        sim.schedule(1000);
        let rsp = sim.last_get(client).expect("get completed");
        assert_eq!(rsp.values, vec![Value::from(1)]);
        assert_eq!(rsp.clocks.len(), 1);
    }

    #[test]
    fn coordinator_failing_before_forward_still_eventually_completes() {
        let (mut sim, nodes, client) = setup();
        let destnode = nodes[0];
        sim.put(client, "K1".into(), Clock::None, Value::from(1), Some(destnode));
        sim.fail(destnode);
        sim.schedule(1000);
        assert!(sim.last_put(client).is_some());
        assert!(
            sim.history().count(Tag::Drop) >= 1,
            "the ClientPut sent to the now-failed destnode is dropped, forcing the client's retry timer to re-send elsewhere"
        );
    }

    #[test]
    fn two_replicas_failing_mid_put_triggers_hinted_handoff_and_still_completes() {
        let (mut sim, _nodes, client) = setup();
        let order = sim.full_ring_order("K1");
        assert!(order.len() >= 5, "need at least 5 ring entries to exercise two failovers");

        sim.put(client, "K1".into(), Clock::None, Value::from(1), Some(order[0]));
        sim.schedule(1);
        sim.fail(order[1]);
        sim.fail(order[2]);
        sim.schedule(1000);

        assert!(sim.last_put(client).is_some(), "put still reaches W=2 via failover to further replicas");
        let known_failed = sim.failed_nodes_known_to(order[0]);
        assert!(known_failed.contains(&order[1]));
        assert!(known_failed.contains(&order[2]));

        sim.recover(order[1]);
        sim.recover(order[2]);
        sim.schedule(4000);

        assert!(
            sim.stored(order[1], "K1").iter().any(|(v, _)| *v == Value::from(1)),
            "recovered original replica received its hinted-handoff write"
        );
        assert!(
            sim.stored(order[2], "K1").iter().any(|(v, _)| *v == Value::from(1)),
            "recovered original replica received its hinted-handoff write"
        );
    }

    #[test]
    fn removed_node_is_purged_from_the_ring_and_its_timers_never_fire() {
        let (mut sim, nodes, client) = setup();
        let destnode = nodes[0];
        sim.put(client, "K1".into(), Clock::None, Value::from(1), Some(destnode));
        assert!(sim.pending_timers() > 0);
        sim.remove(destnode);
        assert_eq!(sim.pending_timers(), 0);
        sim.schedule(1000);
        assert!(sim.last_put(client).is_some(), "remaining preference-list members still reach quorum");
    }

    #[test]
    fn partition_then_divergent_writes_surface_as_siblings_on_read() {
        let (mut sim, nodes, a) = setup();
        let b = sim.add_client(None);

        sim.put(a, "K1".into(), Clock::None, Value::from(1), None);
        sim.schedule(1000);
        let c1 = sim.last_put(a).expect("first put completed").metadata.clone();

        for &x in &nodes[..3] {
            for &y in &nodes[3..] {
                sim.cut_wires(x, y);
                sim.cut_wires(y, x);
            }
            sim.cut_wires(x, b);
            sim.cut_wires(b, x);
        }
        for &y in &nodes[3..] {
            sim.cut_wires(y, a);
            sim.cut_wires(a, y);
        }

        sim.put(a, "K1".into(), Clock::One(c1), Value::from(11), None);
        sim.get(b, "K1".into(), None);
        sim.schedule(1000);
        let getrsp = sim.last_get(b).cloned().expect("b's get completed against its own side of the partition");
        sim.put(b, "K1".into(), Clock::Many(getrsp.clocks), Value::from(21), None);
        sim.schedule(1000);

        for &x in &nodes[..3] {
            for &y in &nodes[3..] {
                sim.restore_wires(x, y);
                sim.restore_wires(y, x);
            }
        }
        sim.schedule(2000);

        sim.get(a, "K1".into(), None);
        sim.schedule(1000);
        let rsp = sim.last_get(a).expect("post-repair get completed");
        assert_eq!(rsp.values.len(), 2, "divergent writes must surface as exactly two siblings, got {:?}", rsp.values);
        let mut values: Vec<_> = rsp.values.iter().map(|v| v.as_i64().expect("integer value")).collect();
        values.sort_unstable();
        assert_eq!(values, vec![11, 21]);
        assert_eq!(
            rsp.clocks[0].partial_cmp(&rsp.clocks[1]),
            None,
            "sibling clocks must be mutually incomparable, got {} and {}",
            rsp.clocks[0],
            rsp.clocks[1]
        );
    }
}
