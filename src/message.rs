//! Message taxonomy: a tagged sum type standing in for runtime dispatch on
//! message type, plus the wire-level envelope every request/response shares.

use serde::{Deserialize, Serialize};

use crate::clock::{Clock, VectorClock};
use crate::node::NodeId;

pub type Key = String;
/// Opaque application value. `serde_json::Value` stands in for "any value
/// the client chose to store", a human-readable payload for dumps and
/// assertions without committing to one concrete value type.
pub type Value = serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientPut {
    pub from: NodeId,
    pub to: NodeId,
    pub key: Key,
    pub value: Value,
    pub metadata: Clock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientPutRsp {
    pub from: NodeId,
    pub to: NodeId,
    pub key: Key,
    pub value: Value,
    pub metadata: VectorClock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutReq {
    pub from: NodeId,
    pub to: NodeId,
    pub msg_id: u64,
    pub key: Key,
    pub value: Value,
    pub metadata: VectorClock,
    /// Non-empty when this replica is a surrogate standing in for the
    /// listed (currently unavailable) original replicas.
    pub handoff: Vec<NodeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutRsp {
    pub from: NodeId,
    pub to: NodeId,
    pub msg_id: u64,
    pub key: Key,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientGet {
    pub from: NodeId,
    pub to: NodeId,
    pub key: Key,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientGetRsp {
    pub from: NodeId,
    pub to: NodeId,
    pub key: Key,
    pub values: Vec<Value>,
    pub clocks: Vec<VectorClock>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetReq {
    pub from: NodeId,
    pub to: NodeId,
    pub msg_id: u64,
    pub key: Key,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRsp {
    pub from: NodeId,
    pub to: NodeId,
    pub msg_id: u64,
    pub key: Key,
    pub value: Option<Value>,
    pub clock: Option<VectorClock>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingReq {
    pub from: NodeId,
    pub to: NodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingRsp {
    pub from: NodeId,
    pub to: NodeId,
}

#[derive(Debug, Clone, derive_more::From)]
pub enum Message {
    ClientPut(ClientPut),
    ClientPutRsp(ClientPutRsp),
    PutReq(PutReq),
    PutRsp(PutRsp),
    ClientGet(ClientGet),
    ClientGetRsp(ClientGetRsp),
    GetReq(GetReq),
    GetRsp(GetRsp),
    PingReq(PingReq),
    PingRsp(PingRsp),
}

impl Message {
    pub fn from_node(&self) -> NodeId {
        match self {
            Message::ClientPut(m) => m.from,
            Message::ClientPutRsp(m) => m.from,
            Message::PutReq(m) => m.from,
            Message::PutRsp(m) => m.from,
            Message::ClientGet(m) => m.from,
            Message::ClientGetRsp(m) => m.from,
            Message::GetReq(m) => m.from,
            Message::GetRsp(m) => m.from,
            Message::PingReq(m) => m.from,
            Message::PingRsp(m) => m.from,
        }
    }

    pub fn to_node(&self) -> NodeId {
        match self {
            Message::ClientPut(m) => m.to,
            Message::ClientPutRsp(m) => m.to,
            Message::PutReq(m) => m.to,
            Message::PutRsp(m) => m.to,
            Message::ClientGet(m) => m.to,
            Message::ClientGetRsp(m) => m.to,
            Message::GetReq(m) => m.to,
            Message::GetRsp(m) => m.to,
            Message::PingReq(m) => m.to,
            Message::PingRsp(m) => m.to,
        }
    }

    pub fn set_to(&mut self, to: NodeId) {
        match self {
            Message::ClientPut(m) => m.to = to,
            Message::ClientPutRsp(m) => m.to = to,
            Message::PutReq(m) => m.to = to,
            Message::PutRsp(m) => m.to = to,
            Message::ClientGet(m) => m.to = to,
            Message::ClientGetRsp(m) => m.to = to,
            Message::GetReq(m) => m.to = to,
            Message::GetRsp(m) => m.to = to,
            Message::PingReq(m) => m.to = to,
            Message::PingRsp(m) => m.to = to,
        }
    }

    /// Correlation id for requests that expect a reply; `None` for
    /// messages with no notion of one (client-facing messages, pings).
    pub fn msg_id(&self) -> Option<u64> {
        match self {
            Message::PutReq(m) => Some(m.msg_id),
            Message::PutRsp(m) => Some(m.msg_id),
            Message::GetReq(m) => Some(m.msg_id),
            Message::GetRsp(m) => Some(m.msg_id),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::ClientPut(_) => "ClientPut",
            Message::ClientPutRsp(_) => "ClientPutRsp",
            Message::PutReq(_) => "PutReq",
            Message::PutRsp(_) => "PutRsp",
            Message::ClientGet(_) => "ClientGet",
            Message::ClientGetRsp(_) => "ClientGetRsp",
            Message::GetReq(_) => "GetReq",
            Message::GetRsp(_) => "GetRsp",
            Message::PingReq(_) => "PingReq",
            Message::PingRsp(_) => "PingRsp",
        }
    }
}
