//! Wire documents for the registry protocol.
//!
//! Requests and responses are single JSON documents, one per line. A
//! connection may carry any number of request/response pairs; a request the
//! registry cannot read is answered with [`INVALID_JSON`] or
//! [`INVALID_REQUEST`] and the connection stays open.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::record::{NodeRecord, NodeStatus};

/// Acknowledgement for a successful `REGISTER`.
pub(crate) const REGISTERED: &str = "REGISTERED";
/// Reply to a line that is not valid JSON.
pub(crate) const INVALID_JSON: &str = "INVALID_JSON";
/// Reply to valid JSON that is not a known request.
pub(crate) const INVALID_REQUEST: &str = "INVALID_REQUEST";

/// A request to the registry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub(crate) enum Request {
    #[serde(rename = "REGISTER")]
    Register { server: String, ip: String, port: u16 },
    #[serde(rename = "QUERY")]
    Query { server: String },
    #[serde(rename = "LIST")]
    List,
}

/// The registry's answer to one request.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Response {
    Registered,
    Record(NodeRecord),
    Miss,
    Servers(ServerList),
    InvalidJson,
    InvalidRequest,
}

impl Response {
    /// Serialize to a single JSON document (no trailing newline).
    pub(crate) fn to_json(&self) -> String {
        match self {
            Self::Registered => serde_json::to_string(REGISTERED),
            Self::Record(record) => serde_json::to_string(record),
            Self::Miss => serde_json::to_string(&StatusReply {
                status: NodeStatus::Fail,
            }),
            Self::Servers(list) => serde_json::to_string(list),
            Self::InvalidJson => serde_json::to_string(INVALID_JSON),
            Self::InvalidRequest => serde_json::to_string(INVALID_REQUEST),
        }
        .expect("registry documents always serialize")
    }
}

/// Body of a `QUERY` miss: `{"status":"FAIL"}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct StatusReply {
    pub(crate) status: NodeStatus,
}

/// Body of a `LIST` reply.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct ServerList {
    pub(crate) servers: BTreeMap<String, NodeRecord>,
}

/// Everything a `QUERY` may come back with.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum QueryReply {
    Record(NodeRecord),
    Status(StatusReply),
    Token(String),
}

/// Everything a `LIST` may come back with.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum ListReply {
    Servers(ServerList),
    Token(String),
}
