//! FIFO message queue plus directional network-partition cuts.
//!
//! Delivery order is the order messages were enqueued; a cut wire causes a
//! message to be dropped (and recorded) rather than delivered, but does not
//! otherwise disturb queue order.

use std::collections::{HashSet, VecDeque};

use crate::history::{Event, History, Tag};
use crate::message::Message;
use crate::node::NodeId;

#[derive(Debug, Default)]
pub struct Scheduler {
    queue: VecDeque<Message>,
    cuts: HashSet<(NodeId, NodeId)>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    /// Enqueue a message originated by its sender.
    pub fn send(&mut self, msg: Message, history: &mut History) {
        self.enqueue(msg, Tag::Send, history);
    }

    /// Enqueue a message a coordinator is relaying on behalf of someone else.
    pub fn forward(&mut self, msg: Message, history: &mut History) {
        self.enqueue(msg, Tag::Forward, history);
    }

    fn enqueue(&mut self, msg: Message, tag: Tag, history: &mut History) {
        history.record(
            tag,
            Event::Message {
                from: msg.from_node(),
                to: msg.to_node(),
                kind: msg.kind(),
                msg_id: msg.msg_id(),
            },
        );
        self.queue.push_back(msg);
    }

    /// Block delivery from `from` to `to` until restored. Directional: the
    /// reverse direction is unaffected unless cut separately.
    pub fn cut_wires(&mut self, from: NodeId, to: NodeId, history: &mut History) {
        if self.cuts.insert((from, to)) {
            history.record(
                Tag::Cut,
                Event::Message {
                    from,
                    to,
                    kind: "wire",
                    msg_id: None,
                },
            );
        }
    }

    pub fn restore_wires(&mut self, from: NodeId, to: NodeId, history: &mut History) {
        if self.cuts.remove(&(from, to)) {
            history.record(Tag::Announce, Event::Note(format!("wire restored {from}->{to}")));
        }
    }

    pub fn reachable(&self, from: NodeId, to: NodeId) -> bool {
        !self.cuts.contains(&(from, to))
    }

    /// Pop the next deliverable message, dropping (and recording) any whose
    /// destination has failed or whose wire is currently cut, until one is
    /// delivered or the queue drains.
    pub fn pop_message(&mut self, is_failed: impl Fn(NodeId) -> bool, history: &mut History) -> Option<Message> {
        while let Some(msg) = self.queue.pop_front() {
            let (from, to) = (msg.from_node(), msg.to_node());
            let kind = msg.kind();
            let msg_id = msg.msg_id();
            if is_failed(to) {
                history.record(Tag::Drop, Event::Message { from, to, kind, msg_id });
                continue;
            }
            if !self.reachable(from, to) {
                history.record(Tag::Cut, Event::Message { from, to, kind, msg_id });
                continue;
            }
            history.record(Tag::Deliver, Event::Message { from, to, kind, msg_id });
            return Some(msg);
        }
        None
    }
}
