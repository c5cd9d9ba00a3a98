//! Protocol message catalogue and wire encoding.
//!
//! Every message travelling between the exchange server, the debug clients
//! (one per rank) and the mdb client is a [`Message`]. On the wire a message
//! is the JSON object
//!
//! ```text
//! {"msg_type": "<tag>", "data": {...}}
//! ```
//!
//! framed by [`crate::connection`]. The tag set is closed:
//!
//! | Tag                         | Direction                          |
//! |-----------------------------|------------------------------------|
//! | `debug_conn_request`        | debug client → exchange            |
//! | `mdb_conn_response`         | exchange → debug client / mdb client |
//! | `debug_init_complete`       | debug client → exchange            |
//! | `mdb_conn_request`          | mdb client → exchange              |
//! | `mdb_command_request`       | mdb client → exchange → debug client |
//! | `mdb_interrupt_request`     | mdb client → exchange → debug client |
//! | `debug_command_response`    | debug client → exchange            |
//! | `exchange_command_response` | exchange → mdb client              |
//! | `exchange_info`             | exchange → mdb client              |
//! | `ping` / `pong`             | liveness probe, either direction   |
//!
//! The `mdb_conn_response` tag is reused by the wire protocol for two
//! shapes: the bare `{from, to}` registration ack sent to a debug client,
//! and the topology reply sent to the mdb client. The enum models both with
//! one variant whose topology fields are optional and omitted when absent.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Peer identity string for the user-facing client.
pub const MDB_CLIENT: &str = "mdb client";
/// Peer identity string for the per-rank debugger wrapper.
pub const DEBUG_CLIENT: &str = "debug client";
/// Peer identity string for the exchange server.
pub const EXCHANGE: &str = "exchange server";

/// One protocol message, tagged by `msg_type` with its payload under `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg_type", content = "data")]
pub enum Message {
    /// Debug client opens registration with the exchange.
    #[serde(rename = "debug_conn_request")]
    DebugConnRequest {
        /// Sender identity.
        from: String,
        /// Receiver identity.
        to: String,
    },

    /// Exchange acknowledgement / topology reply.
    ///
    /// Sent to a debug client as a bare ack (topology fields absent), and
    /// to the mdb client with the topology filled in.
    #[serde(rename = "mdb_conn_response")]
    MdbConnResponse {
        /// Sender identity.
        from: String,
        /// Receiver identity.
        to: String,
        /// Total number of ranks in the job (mdb client reply only).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        no_of_ranks: Option<u32>,
        /// Name of the debugger backend in use (mdb client reply only).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        backend_name: Option<String>,
        /// The launch-time rank selection string (mdb client reply only).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        select_str: Option<String>,
    },

    /// Debug client reports its backend is attached and past start.
    #[serde(rename = "debug_init_complete")]
    DebugInitComplete {
        /// Sender identity.
        from: String,
        /// Receiver identity.
        to: String,
    },

    /// Mdb client attaches to the exchange.
    #[serde(rename = "mdb_conn_request")]
    MdbConnRequest {
        /// Sender identity.
        from: String,
        /// Receiver identity.
        to: String,
    },

    /// Run `command` on every rank in `select`.
    #[serde(rename = "mdb_command_request")]
    MdbCommandRequest {
        /// Sender identity.
        from: String,
        /// Receiver identity.
        to: String,
        /// Opaque debugger command text.
        command: String,
        /// Ranks the command is addressed to.
        select: Vec<u32>,
    },

    /// Cancel the in-flight command on every rank.
    #[serde(rename = "mdb_interrupt_request")]
    MdbInterruptRequest {
        /// Sender identity.
        from: String,
        /// Receiver identity.
        to: String,
        /// Always the literal `"interrupt"`.
        command: String,
    },

    /// Per-rank command output (exactly one entry, keyed by the rank).
    #[serde(rename = "debug_command_response")]
    DebugCommandResponse {
        /// Sender identity.
        from: String,
        /// Receiver identity.
        to: String,
        /// `{rank: output}` for the responding rank only.
        result: HashMap<u32, String>,
    },

    /// Aggregated output across all registered ranks.
    #[serde(rename = "exchange_command_response")]
    ExchangeCommandResponse {
        /// Sender identity.
        from: String,
        /// Receiver identity.
        to: String,
        /// `{rank: output}` for every registered rank.
        results: HashMap<u32, String>,
    },

    /// Out-of-band notice from the exchange (timeouts, shutdown, rejections).
    #[serde(rename = "exchange_info")]
    ExchangeInfo {
        /// Sender identity.
        from: String,
        /// Receiver identity.
        to: String,
        /// Human-readable notice text.
        message: String,
    },

    /// Liveness probe.
    #[serde(rename = "ping")]
    Ping {},

    /// Probe reply.
    #[serde(rename = "pong")]
    Pong {},
}

impl Message {
    /// Registration request from a debug client.
    pub fn debug_conn_request() -> Self {
        Message::DebugConnRequest {
            from: DEBUG_CLIENT.to_owned(),
            to: EXCHANGE.to_owned(),
        }
    }

    /// Registration ack sent back to a debug client.
    ///
    /// Carries no payload; the wire tag is `mdb_conn_response`.
    pub fn debug_conn_response() -> Self {
        Message::MdbConnResponse {
            from: EXCHANGE.to_owned(),
            to: DEBUG_CLIENT.to_owned(),
            no_of_ranks: None,
            backend_name: None,
            select_str: None,
        }
    }

    /// Init-complete notification from a debug client.
    pub fn debug_init_complete() -> Self {
        Message::DebugInitComplete {
            from: DEBUG_CLIENT.to_owned(),
            to: EXCHANGE.to_owned(),
        }
    }

    /// Attach request from the mdb client.
    pub fn mdb_conn_request() -> Self {
        Message::MdbConnRequest {
            from: MDB_CLIENT.to_owned(),
            to: EXCHANGE.to_owned(),
        }
    }

    /// Topology reply sent to the mdb client.
    pub fn mdb_conn_response(no_of_ranks: u32, backend_name: &str, select_str: &str) -> Self {
        Message::MdbConnResponse {
            from: EXCHANGE.to_owned(),
            to: MDB_CLIENT.to_owned(),
            no_of_ranks: Some(no_of_ranks),
            backend_name: Some(backend_name.to_owned()),
            select_str: Some(select_str.to_owned()),
        }
    }

    /// Command request addressed to the ranks in `select`.
    pub fn mdb_command_request(command: &str, select: &[u32]) -> Self {
        Message::MdbCommandRequest {
            from: MDB_CLIENT.to_owned(),
            to: EXCHANGE.to_owned(),
            command: command.to_owned(),
            select: select.to_vec(),
        }
    }

    /// Out-of-band interrupt request.
    pub fn mdb_interrupt_request() -> Self {
        Message::MdbInterruptRequest {
            from: MDB_CLIENT.to_owned(),
            to: EXCHANGE.to_owned(),
            command: "interrupt".to_owned(),
        }
    }

    /// Per-rank response carrying this rank's output.
    pub fn debug_command_response(result: HashMap<u32, String>) -> Self {
        Message::DebugCommandResponse {
            from: DEBUG_CLIENT.to_owned(),
            to: EXCHANGE.to_owned(),
            result,
        }
    }

    /// Aggregate one round of per-rank responses into a single reply.
    ///
    /// Non-`debug_command_response` entries are skipped; the caller is
    /// responsible for the same-tag check before aggregating.
    pub fn exchange_command_response(responses: &[Message]) -> Self {
        let mut results = HashMap::new();
        for msg in responses {
            if let Message::DebugCommandResponse { result, .. } = msg {
                results.extend(result.iter().map(|(k, v)| (*k, v.clone())));
            }
        }
        Message::ExchangeCommandResponse {
            from: EXCHANGE.to_owned(),
            to: MDB_CLIENT.to_owned(),
            results,
        }
    }

    /// Out-of-band notice to the mdb client.
    pub fn exchange_info(message: &str) -> Self {
        Message::ExchangeInfo {
            from: EXCHANGE.to_owned(),
            to: MDB_CLIENT.to_owned(),
            message: message.to_owned(),
        }
    }

    /// Liveness probe.
    pub fn ping() -> Self {
        Message::Ping {}
    }

    /// Probe reply.
    pub fn pong() -> Self {
        Message::Pong {}
    }

    /// The wire tag of this message, for logging and dispatch.
    pub fn tag(&self) -> &'static str {
        match self {
            Message::DebugConnRequest { .. } => "debug_conn_request",
            Message::MdbConnResponse { .. } => "mdb_conn_response",
            Message::DebugInitComplete { .. } => "debug_init_complete",
            Message::MdbConnRequest { .. } => "mdb_conn_request",
            Message::MdbCommandRequest { .. } => "mdb_command_request",
            Message::MdbInterruptRequest { .. } => "mdb_interrupt_request",
            Message::DebugCommandResponse { .. } => "debug_command_response",
            Message::ExchangeCommandResponse { .. } => "exchange_command_response",
            Message::ExchangeInfo { .. } => "exchange_info",
            Message::Ping {} => "ping",
            Message::Pong {} => "pong",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_request_wire_shape() {
        let msg = Message::mdb_command_request("bt", &[0, 2]);
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "msg_type": "mdb_command_request",
                "data": {
                    "from": MDB_CLIENT,
                    "to": EXCHANGE,
                    "command": "bt",
                    "select": [0, 2],
                },
            })
        );
    }

    #[test]
    fn test_debug_conn_response_omits_topology() {
        let value = serde_json::to_value(Message::debug_conn_response()).unwrap();
        assert_eq!(value["msg_type"], "mdb_conn_response");
        assert!(value["data"].get("no_of_ranks").is_none());
        assert!(value["data"].get("backend_name").is_none());
    }

    #[test]
    fn test_conn_response_roundtrip_with_topology() {
        let msg = Message::mdb_conn_response(8, "gdb", "0-7");
        let bytes = serde_json::to_vec(&msg).unwrap();
        let decoded: Message = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_rank_keys_roundtrip_as_integers() {
        let results = HashMap::from([(0, "a".to_owned()), (12, "b".to_owned())]);
        let msg = Message::ExchangeCommandResponse {
            from: EXCHANGE.to_owned(),
            to: MDB_CLIENT.to_owned(),
            results,
        };
        let bytes = serde_json::to_vec(&msg).unwrap();
        // JSON object keys are strings on the wire.
        let raw: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(raw["data"]["results"]["12"], "b");
        // But they come back as integer ranks.
        let decoded: Message = serde_json::from_slice(&bytes).unwrap();
        match decoded {
            Message::ExchangeCommandResponse { results, .. } => {
                assert_eq!(results.get(&12).map(String::as_str), Some("b"));
                assert_eq!(results.get(&0).map(String::as_str), Some("a"));
            }
            other => panic!("wrong variant: {}", other.tag()),
        }
    }

    #[test]
    fn test_aggregation_merges_rank_maps() {
        let a = Message::debug_command_response(HashMap::from([(0, "x".to_owned())]));
        let b = Message::debug_command_response(HashMap::from([(1, String::new())]));
        match Message::exchange_command_response(&[a, b]) {
            Message::ExchangeCommandResponse { results, .. } => {
                assert_eq!(results.len(), 2);
                assert_eq!(results[&0], "x");
                assert_eq!(results[&1], "");
            }
            other => panic!("wrong variant: {}", other.tag()),
        }
    }

    #[test]
    fn test_ping_carries_empty_data() {
        let value = serde_json::to_value(Message::ping()).unwrap();
        assert_eq!(value, json!({"msg_type": "ping", "data": {}}));
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        let raw = json!({"msg_type": "mdb_surprise", "data": {}});
        assert!(serde_json::from_value::<Message>(raw).is_err());
    }
}
