//! Append-only event history, the substrate assertions and ladder-style
//! diagnostics are built from.

use crate::node::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Add,
    Remove,
    Fail,
    Recover,
    Send,
    Forward,
    Deliver,
    Drop,
    Cut,
    Start,
    Cancel,
    Pop,
    Announce,
}

#[derive(Debug, Clone)]
pub enum Event {
    Node(NodeId),
    Message {
        from: NodeId,
        to: NodeId,
        kind: &'static str,
        msg_id: Option<u64>,
    },
    Timer {
        node: NodeId,
        reason: &'static str,
    },
    Note(String),
}

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub tag: Tag,
    pub event: Event,
}

#[derive(Debug, Default)]
pub struct History {
    entries: Vec<HistoryEntry>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, tag: Tag, event: Event) {
        self.entries.push(HistoryEntry { tag, event });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn since(&self, start: usize) -> &[HistoryEntry] {
        &self.entries[start.min(self.entries.len())..]
    }

    pub fn count(&self, tag: Tag) -> usize {
        self.entries.iter().filter(|e| e.tag == tag).count()
    }

    /// One line per event: a plain textual substitute for a full
    /// ladder-diagram renderer, which is an out-of-scope external
    /// collaborator that would need its own column-placement/box-drawing
    /// algorithm.
    pub fn summary_lines(&self, names: impl Fn(NodeId) -> String) -> Vec<String> {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, entry)| format!("{i}: {}", Self::describe(entry, &names)))
            .collect()
    }

    fn describe(entry: &HistoryEntry, names: &impl Fn(NodeId) -> String) -> String {
        let tag = match entry.tag {
            Tag::Add => "add",
            Tag::Remove => "remove",
            Tag::Fail => "fail",
            Tag::Recover => "recover",
            Tag::Send => "send",
            Tag::Forward => "forward",
            Tag::Deliver => "deliver",
            Tag::Drop => "drop",
            Tag::Cut => "cut",
            Tag::Start => "start",
            Tag::Cancel => "cancel",
            Tag::Pop => "pop",
            Tag::Announce => "announce",
        };
        match &entry.event {
            Event::Node(id) => format!("{tag} {}", names(*id)),
            Event::Message {
                from,
                to,
                kind,
                msg_id,
            } => match msg_id {
                Some(id) => format!("{tag} {}->{} {kind}#{id}", names(*from), names(*to)),
                None => format!("{tag} {}->{} {kind}", names(*from), names(*to)),
            },
            Event::Timer { node, reason } => format!("{tag} timer({reason}) at {}", names(*node)),
            Event::Note(text) => format!("{tag} {text}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeKind, NodeTable};

    #[test]
    fn records_and_filters_by_tag() {
        let mut table = NodeTable::new();
        let a = table.create(NodeKind::Replica, None);
        let mut history = History::new();
        history.record(Tag::Add, Event::Node(a));
        history.record(Tag::Fail, Event::Node(a));
        assert_eq!(history.count(Tag::Add), 1);
        assert_eq!(history.count(Tag::Fail), 1);
        assert_eq!(history.count(Tag::Recover), 0);
    }

    #[test]
    fn since_returns_suffix() {
        let mut table = NodeTable::new();
        let a = table.create(NodeKind::Replica, None);
        let mut history = History::new();
        history.record(Tag::Add, Event::Node(a));
        let mark = history.len();
        history.record(Tag::Fail, Event::Node(a));
        assert_eq!(history.since(mark).len(), 1);
    }
}
