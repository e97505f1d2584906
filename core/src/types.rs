use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ---------------------------------------------------------------------------
// Action — the type of file access observed from ACP messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// User embedded file content in prompt (@mention)
    UserProvided,
    /// User sent resource_link in prompt
    UserReferenced,
    /// Agent read file (tool call or fs/read_text_file)
    Read,
    /// Agent wrote file (tool call or fs/write_text_file)
    Write,
    /// Agent searched (grep/glob — path is a directory)
    Search,
}

impl Action {
    /// Actions that put a file "in context" per the data model invariant.
    /// Search surfaces that a file exists without the agent reading its
    /// content, so it does not enter context.
    pub fn enters_context(self) -> bool {
        matches!(
            self,
            Action::Read | Action::Write | Action::UserProvided | Action::UserReferenced
        )
    }
}

// ---------------------------------------------------------------------------
// FileAccess — one observed access, as returned by the pure classifier
// ---------------------------------------------------------------------------

/// A single file access extracted from one ACP line. The classifier never
/// touches the tracker directly — it returns these, and the caller applies
/// them after any zone check has had a chance to veto the operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAccess {
    pub path: String,
    pub action: Action,
}

impl FileAccess {
    pub fn new(path: impl Into<String>, action: Action) -> Self {
        Self {
            path: path.into(),
            action,
        }
    }
}

// ---------------------------------------------------------------------------
// FileNode — a tracked file in the graph
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileNode {
    pub path: String,
    /// 0.0 to 1.0 — activity level, decayed linearly in wall-clock time.
    pub heat: f32,
    /// Whether the file is inferred to still be in the agent's context window.
    pub in_context: bool,
    /// Most recent action type.
    pub last_action: Action,
    /// Last turn this file was accessed.
    pub turn_accessed: u64,
    /// Wall-clock milliseconds (epoch) when this file was last accessed.
    /// Used by the orchestrator for LWW merge ordering across agents.
    pub timestamp_ms: u64,
}

impl FileNode {
    pub fn to_update(&self) -> NodeUpdate {
        NodeUpdate {
            path: self.path.clone(),
            heat: self.heat,
            in_context: self.in_context,
            last_action: self.last_action,
            turn_accessed: self.turn_accessed,
            timestamp_ms: self.timestamp_ms,
        }
    }
}

// ---------------------------------------------------------------------------
// NodeUpdate — an update to a single file within a delta
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeUpdate {
    pub path: String,
    pub heat: f32,
    pub in_context: bool,
    pub last_action: Action,
    pub turn_accessed: u64,
    pub timestamp_ms: u64,
}

// ---------------------------------------------------------------------------
// Wire messages: server -> subscriber
// ---------------------------------------------------------------------------

/// Full state snapshot, sent on connect and on request_snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(rename = "type")]
    pub msg_type: String, // always "snapshot"
    pub agent_id: String,
    pub session_id: String,
    pub seq: u64,
    pub nodes: HashMap<String, FileNode>,
}

impl Snapshot {
    pub fn new(agent_id: &str, session_id: &str, seq: u64, nodes: HashMap<String, FileNode>) -> Self {
        Self {
            msg_type: "snapshot".to_string(),
            agent_id: agent_id.to_string(),
            session_id: session_id.to_string(),
            seq,
            nodes,
        }
    }
}

/// Incremental update — only changed/removed nodes since the last emission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    #[serde(rename = "type")]
    pub msg_type: String, // always "delta"
    pub agent_id: String,
    pub session_id: String,
    pub seq: u64,
    pub updates: Vec<NodeUpdate>,
    pub removed: Vec<String>,
}

impl Delta {
    pub fn new(
        agent_id: &str,
        session_id: &str,
        seq: u64,
        updates: Vec<NodeUpdate>,
        removed: Vec<String>,
    ) -> Self {
        Self {
            msg_type: "delta".to_string(),
            agent_id: agent_id.to_string(),
            session_id: session_id.to_string(),
            seq,
            updates,
            removed,
        }
    }
}

/// Token usage report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageMessage {
    #[serde(rename = "type")]
    pub msg_type: String, // always "usage"
    pub agent_id: String,
    pub session_id: String,
    pub used: u32,
    pub size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<Cost>,
}

impl UsageMessage {
    pub fn new(agent_id: &str, session_id: &str, used: u32, size: u32, cost: Option<Cost>) -> Self {
        Self {
            msg_type: "usage".to_string(),
            agent_id: agent_id.to_string(),
            session_id: session_id.to_string(),
            used,
            size,
            cost,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cost {
    pub amount: f64,
    pub currency: String,
}

// ---------------------------------------------------------------------------
// Wire messages: subscriber -> server (control channel)
// ---------------------------------------------------------------------------

/// Messages a TCP subscriber may send back on the same connection.
/// `request_snapshot` carries no `id`; RPC requests do, which is how a
/// subscriber's line is told apart from a streaming control message.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    RequestSnapshot,
    Rpc {
        id: String,
        method: String,
        #[serde(default)]
        params: Option<serde_json::Value>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcResponse {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl RpcResponse {
    pub fn result(id: String, value: serde_json::Value) -> Self {
        Self {
            id,
            result: Some(value),
            error: None,
        }
    }

    pub fn error(id: String, code: i32, message: String) -> Self {
        Self {
            id,
            result: None,
            error: Some(RpcError { code, message }),
        }
    }
}

// ---------------------------------------------------------------------------
// TrackerConfig — tuning knobs for the ContextTracker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Milliseconds of wall-clock decay for heat to drop from 1.0 to 0.0
    /// linearly (default: 1500, `EISEN_DECAY_MS`).
    pub decay_ms: u64,
    /// Turns a node may sit below the heat epsilon before GC (default: 3,
    /// `EISEN_GC_TURNS`).
    pub gc_turns: u64,
    /// Usage drop ratio that signals compaction (default: 0.5).
    pub compaction_threshold: f32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            decay_ms: 1500,
            gc_turns: 3,
            compaction_threshold: 0.5,
        }
    }
}

impl TrackerConfig {
    /// Build from environment, falling back to defaults for unset or
    /// unparsable values.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("EISEN_DECAY_MS") {
            if let Ok(parsed) = v.parse() {
                cfg.decay_ms = parsed;
            }
        }
        if let Ok(v) = std::env::var("EISEN_GC_TURNS") {
            if let Ok(parsed) = v.parse() {
                cfg.gc_turns = parsed;
            }
        }
        cfg
    }
}

pub const HEAT_EPSILON: f32 = 0.01;

/// Bounded ring capacity for delta replay (`delta_since`).
pub const DELTA_RING_CAPACITY: usize = 256;
