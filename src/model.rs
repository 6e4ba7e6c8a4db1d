//! Wire-level data types: the two record shapes the bus topic carries.
//!
//! `StartRequest` is parsed from an inbound record whose payload contains
//! the literal substring `"exe":`. `StatusRecord` is the shape this agent
//! both emits (as a periodic/terminal report) and later recognizes when it
//! comes back through the inbound stream as an ack (then only the `ref`
//! field is used — see [`crate::frame`]).

use serde::{Deserialize, Serialize};

/// An accepted job awaiting dispatch.
///
/// `msgnum` is assigned by the bus and never synthesized locally.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct StartRequest {
    #[serde(skip)]
    pub msgnum: u32,
    pub src: String,
    pub exe: String,
    #[serde(default)]
    pub dir: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub secs: u64,
}

/// Either a periodic progress report or a terminal completion.
///
/// Per spec.md §9, `exit` is conventionally `0` on periodic records even
/// though the child is still running — callers distinguish periodic from
/// terminal records by context, not by this field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusRecord {
    pub when: String,
    #[serde(rename = "ref")]
    pub ref_: u32,
    pub pid: u32,
    pub exit: i32,
    pub op: String,
}

impl StatusRecord {
    /// Build a status record with the current UTC time as `when`.
    pub fn now(ref_: u32, pid: u32, exit: i32, op: String) -> Self {
        StatusRecord {
            when: chrono::Utc::now().to_rfc3339(),
            ref_,
            pid,
            exit,
            op,
        }
    }
}

/// Only the field the core cares about from an inbound ack. Other fields
/// in the ack payload are ignored per spec.md §6.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct AckRef {
    #[serde(rename = "ref")]
    pub ref_: u32,
}
