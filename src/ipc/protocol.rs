//! Wire protocol message types for daemon IPC.
//!
//! All messages are MessagePack-encoded maps with at minimum `type` and
//! `id` fields. Handles travel as raw `u64` tokens (see
//! [`crate::table::Handle::to_raw`]).

use serde::{Deserialize, Serialize};

use crate::table::TableStats;

/// All wire protocol messages.
///
/// Serialized as a tagged union on the `type` field via MessagePack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Message {
    // -- Handshake --
    #[serde(rename = "hello")]
    Hello { id: u32, version: u32 },

    #[serde(rename = "hello_ack")]
    HelloAck {
        id: u32,
        status: Status,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    // -- Event lifecycle --
    #[serde(rename = "create")]
    Create { id: u32 },

    #[serde(rename = "wait")]
    Wait { id: u32, handle: u64, timeout_ms: u64 },

    #[serde(rename = "notify")]
    Notify { id: u32, handle: u64 },

    #[serde(rename = "destroy")]
    Destroy { id: u32, handle: u64 },

    // -- Query --
    #[serde(rename = "stats")]
    Stats { id: u32 },

    // -- Generic response --
    #[serde(rename = "response")]
    Response {
        id: u32,
        status: Status,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        /// Set by `create`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        handle: Option<u64>,
        /// Set by `wait` (signaled vs timed out) and `notify` (delivered).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signaled: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stats: Option<StatsDescriptor>,
    },
}

impl Message {
    /// Plain success response.
    pub fn ok(id: u32) -> Self {
        Message::Response {
            id,
            status: Status::Ok,
            error: None,
            handle: None,
            signaled: None,
            stats: None,
        }
    }

    /// Error response carrying a machine-readable reason.
    pub fn error(id: u32, reason: &str) -> Self {
        Message::Response {
            id,
            status: Status::Error,
            error: Some(reason.to_string()),
            handle: None,
            signaled: None,
            stats: None,
        }
    }
}

/// Response status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
}

/// Table counters returned in `stats` responses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatsDescriptor {
    pub live: u32,
    pub waiting: u32,
    pub created: u64,
    pub signaled: u64,
    pub timed_out: u64,
    pub destroyed: u64,
    /// Connections that completed the handshake.
    pub connections: u32,
}

impl StatsDescriptor {
    pub fn new(stats: TableStats, connections: u32) -> Self {
        Self {
            live: stats.live,
            waiting: stats.waiting,
            created: stats.created,
            signaled: stats.signaled,
            timed_out: stats.timed_out,
            destroyed: stats.destroyed,
            connections,
        }
    }
}

/// Protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum payload size (64 KiB). Messages carry no bulk data.
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

/// Minimal envelope for extracting `{type, id}` from unknown messages.
///
/// Used by the daemon as a fallback when [`Message`] deserialization
/// fails, so the error response can echo the request `id`.
#[derive(Debug, Deserialize)]
pub struct RawEnvelope {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub id: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: &Message) -> Message {
        let encoded = rmp_serde::to_vec_named(msg).unwrap();
        rmp_serde::from_slice(&encoded).unwrap()
    }

    #[test]
    fn wait_round_trip() {
        let msg = Message::Wait {
            id: 3,
            handle: (2u64 << 32) | 9,
            timeout_ms: 1500,
        };
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn response_with_stats_round_trip() {
        let msg = Message::Response {
            id: 7,
            status: Status::Ok,
            error: None,
            handle: None,
            signaled: None,
            stats: Some(StatsDescriptor {
                live: 2,
                waiting: 1,
                created: 10,
                signaled: 5,
                timed_out: 2,
                destroyed: 1,
                connections: 3,
            }),
        };
        assert_eq!(round_trip(&msg), msg);
    }

    #[test]
    fn type_tag_is_snake_case() {
        #[derive(Deserialize)]
        struct Tagged {
            #[serde(rename = "type")]
            msg_type: String,
            status: String,
            error: Option<String>,
        }
        let encoded = rmp_serde::to_vec_named(&Message::HelloAck {
            id: 0,
            status: Status::Ok,
            error: None,
        })
        .unwrap();
        let tagged: Tagged = rmp_serde::from_slice(&encoded).unwrap();
        assert_eq!(tagged.msg_type, "hello_ack");
        assert_eq!(tagged.status, "ok");
        assert!(tagged.error.is_none(), "None fields are omitted");
    }

    #[test]
    fn absent_optional_fields_default_to_none() {
        #[derive(Serialize)]
        struct Bare {
            #[serde(rename = "type")]
            msg_type: &'static str,
            id: u32,
            status: Status,
        }
        let encoded = rmp_serde::to_vec_named(&Bare {
            msg_type: "response",
            id: 4,
            status: Status::Ok,
        })
        .unwrap();
        assert_eq!(rmp_serde::from_slice::<Message>(&encoded).unwrap(), Message::ok(4));
    }

    #[test]
    fn error_helper_sets_reason() {
        match Message::error(9, "busy") {
            Message::Response {
                id,
                status: Status::Error,
                error: Some(reason),
                ..
            } => {
                assert_eq!(id, 9);
                assert_eq!(reason, "busy");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn envelope_extracts_unknown_type() {
        #[derive(Serialize)]
        struct Unknown {
            #[serde(rename = "type")]
            msg_type: &'static str,
            id: u32,
        }
        let encoded = rmp_serde::to_vec_named(&Unknown {
            msg_type: "reset",
            id: 12,
        })
        .unwrap();
        assert!(rmp_serde::from_slice::<Message>(&encoded).is_err());
        let envelope: RawEnvelope = rmp_serde::from_slice(&encoded).unwrap();
        assert_eq!(envelope.msg_type, "reset");
        assert_eq!(envelope.id, 12);
    }
}
