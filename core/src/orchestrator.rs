//! Cross-process fan-in: merges file-activity replicas streamed over
//! independent TCP connections from N separate agent processes into one
//! unified view.
//!
//! Each agent process runs its own `observe` and TCP server (`tcp.rs`); the
//! `OrchestratorAggregator` is a *client* of N such servers. It keeps one
//! `AgentFileState` replica per `(path, instance_id)` and derives a single
//! `MergedFileView` per path from whichever replicas are currently present —
//! see `derive_view` for the merge rule. Connection handling (one task per
//! agent, decoding lines and applying them under a shared mutex) lives here
//! too, since this module owns the only state the merge touches.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::types::{Action, Delta, FileNode, NodeUpdate, Snapshot};

/// Path components that are never part of a merged path, beyond any segment
/// starting with `.` (other than `.`/`..`, which are resolved/rejected
/// instead). Mirrors the ignore set a directory walker would use, since the
/// orchestrator sees the same noisy build/vendor trees a walker would.
const IGNORED_SEGMENTS: &[&str] = &[
    "node_modules",
    "dist",
    "build",
    "target",
    "__pycache__",
    "coverage",
    "out",
];

const PALETTE: &[&str] = &[
    "#5b8def", "#e07b39", "#3fb950", "#d14343", "#a371f7", "#39c5cf", "#f0883e", "#79c0ff",
];

/// Normalize a wire path into the orchestrator's merge-key space: strip a
/// leading slash, drop empty/`.` segments, reject any path that escapes its
/// root via `..`, and drop paths under an ignored directory (including any
/// dot-prefixed segment other than `.`/`..`).
fn normalize_path(raw: &str) -> Option<String> {
    let trimmed = raw.strip_prefix('/').unwrap_or(raw);
    let mut parts = Vec::new();
    for segment in trimmed.split('/') {
        if segment.is_empty() || segment == "." {
            continue;
        }
        if segment == ".." {
            return None;
        }
        if segment.starts_with('.') || IGNORED_SEGMENTS.contains(&segment) {
            return None;
        }
        parts.push(segment);
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// Per-type normalization seam. Different agent CLIs report file activity
/// with slightly different vocabularies (e.g. some collapse prompt-supplied
/// context into a single "read" rather than distinguishing `user_provided`/
/// `user_referenced`); an `AgentProcessor` is selected once per connection
/// and applied to every snapshot/delta that connection reports, so the
/// merged view stays comparable across agent types without the aggregator
/// knowing about any particular one.
pub trait AgentProcessor: std::fmt::Debug + Send + Sync {
    fn process_snapshot(&self, nodes: &mut HashMap<String, FileNode>);
    fn process_delta(&self, updates: &mut [NodeUpdate]);
}

#[derive(Debug, Default)]
struct CollapseUserActionsProcessor;

impl AgentProcessor for CollapseUserActionsProcessor {
    fn process_snapshot(&self, nodes: &mut HashMap<String, FileNode>) {
        for node in nodes.values_mut() {
            collapse_user_action(&mut node.last_action);
        }
    }

    fn process_delta(&self, updates: &mut [NodeUpdate]) {
        for update in updates {
            collapse_user_action(&mut update.last_action);
        }
    }
}

fn collapse_user_action(action: &mut Action) {
    if matches!(action, Action::UserProvided | Action::UserReferenced) {
        *action = Action::Read;
    }
}

/// Selects the `AgentProcessor` for a freshly-registered agent. All agent
/// types currently share the same normalization; this is the seam a
/// type-specific processor would be plugged into.
fn processor_for(_agent_type: &str) -> Box<dyn AgentProcessor> {
    Box::new(CollapseUserActionsProcessor)
}

/// One path's replica as reported by a single agent.
#[derive(Debug, Clone)]
struct AgentFileState {
    heat: f32,
    in_context: bool,
    last_action: Action,
    timestamp_ms: u64,
}

impl AgentFileState {
    fn from_node(node: &FileNode) -> Self {
        Self {
            heat: node.heat,
            in_context: node.in_context,
            last_action: node.last_action,
            timestamp_ms: node.timestamp_ms,
        }
    }

    fn from_update(update: &NodeUpdate) -> Self {
        Self {
            heat: update.heat,
            in_context: update.in_context,
            last_action: update.last_action,
            timestamp_ms: update.timestamp_ms,
        }
    }
}

#[derive(Debug, Default)]
struct MergedFileNode {
    /// Replicas currently held, keyed by instance id.
    replicas: HashMap<String, AgentFileState>,
}

/// Derived, per-path view handed to downstream consumers. Commutative,
/// associative, and idempotent in the replicas it was built from: heat is
/// the max across replicas, `in_context` is true if any replica says so, and
/// `last_action`/its agent/timestamp come from whichever replica has the
/// latest `timestamp_ms`, tie-broken by the lexicographically greater
/// instance id so the choice never depends on iteration order.
#[derive(Debug, Clone, Serialize)]
pub struct MergedFileView {
    pub path: String,
    pub heat: f32,
    pub in_context: bool,
    pub last_action: Action,
    pub last_action_agent_id: String,
    pub last_action_timestamp_ms: u64,
}

fn derive_view(path: &str, replicas: &HashMap<String, AgentFileState>) -> MergedFileView {
    let heat = replicas.values().map(|r| r.heat).fold(0.0_f32, f32::max);
    let in_context = replicas.values().any(|r| r.in_context);
    let winner = replicas
        .iter()
        .max_by(|(id_a, a), (id_b, b)| a.timestamp_ms.cmp(&b.timestamp_ms).then_with(|| id_a.cmp(id_b)));
    let (last_action, last_action_agent_id, last_action_timestamp_ms) = match winner {
        Some((id, state)) => (state.last_action, id.clone(), state.timestamp_ms),
        None => (Action::Read, String::new(), 0),
    };
    MergedFileView {
        path: path.to_string(),
        heat,
        in_context,
        last_action,
        last_action_agent_id,
        last_action_timestamp_ms,
    }
}

/// Roster entry for one connected agent, as included in every merged
/// snapshot/delta so a downstream UI can attribute activity and render a
/// legend.
#[derive(Debug, Clone, Serialize)]
pub struct AgentRosterMember {
    pub instance_id: String,
    pub agent_type: String,
    pub display_name: String,
    pub color: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergedSnapshot {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub seq: u64,
    pub nodes: HashMap<String, MergedFileView>,
    pub agents: Vec<AgentRosterMember>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergedDelta {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub seq: u64,
    pub updates: Vec<MergedFileView>,
    pub removed: Vec<String>,
    pub agents: Vec<AgentRosterMember>,
}

struct AgentConnection {
    agent_type: String,
    display_name: String,
    color: String,
    last_seen_seq: u64,
    processor: Box<dyn AgentProcessor>,
}

/// Merges per-file replicas fanned in from N independent agent TCP servers
/// into one derived view, emitted as `MergedSnapshot`/`MergedDelta` lines to
/// `subscribe()`rs. Owns no network listener of its own — it is purely a
/// client of the agents it's told to watch.
pub struct OrchestratorAggregator {
    merged: HashMap<String, MergedFileNode>,
    agents: HashMap<String, AgentConnection>,
    seq: u64,
    next_palette_idx: usize,
    pending_removed: HashSet<String>,
    emit_tx: broadcast::Sender<String>,
}

impl Default for OrchestratorAggregator {
    fn default() -> Self {
        let (emit_tx, _rx) = broadcast::channel(256);
        Self {
            merged: HashMap::new(),
            agents: HashMap::new(),
            seq: 0,
            next_palette_idx: 0,
            pending_removed: HashSet::new(),
            emit_tx,
        }
    }
}

impl OrchestratorAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to the outgoing stream of `MergedSnapshot`/`MergedDelta`
    /// wire lines (each newline-terminated, ready to write as-is).
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.emit_tx.subscribe()
    }

    /// Connect to `instance_id`'s TCP server on `port`, register it in the
    /// roster, and spawn a task that reads and applies its line stream until
    /// the connection drops, at which point the agent and its replicas are
    /// removed automatically.
    pub async fn add_agent(
        me: &Arc<Mutex<Self>>,
        instance_id: String,
        port: u16,
        agent_type: String,
    ) -> std::io::Result<()> {
        let stream = TcpStream::connect(("127.0.0.1", port)).await?;
        let (display_name, color) = {
            let mut agg = me.lock().await;
            agg.register(instance_id.clone(), agent_type)
        };
        info!(instance_id = instance_id.as_str(), display_name = display_name.as_str(), port, "agent connected");
        let _ = color;
        Self::spawn_reader(me.clone(), instance_id, stream);
        Ok(())
    }

    fn spawn_reader(me: Arc<Mutex<Self>>, instance_id: String, stream: TcpStream) {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        me.lock().await.apply_line(&instance_id, &line);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(instance_id = instance_id.as_str(), error = %e, "agent connection read error");
                        break;
                    }
                }
            }
            let mut agg = me.lock().await;
            agg.remove_agent(&instance_id);
        });
    }

    fn register(&mut self, instance_id: String, agent_type: String) -> (String, String) {
        let ordinal = self
            .agents
            .values()
            .filter(|a| a.agent_type == agent_type)
            .count()
            + 1;
        let display_name = format!("{agent_type}_{ordinal}");
        let color = PALETTE[self.next_palette_idx % PALETTE.len()].to_string();
        self.next_palette_idx += 1;
        let processor = processor_for(&agent_type);
        self.agents.insert(
            instance_id,
            AgentConnection {
                agent_type,
                display_name: display_name.clone(),
                color: color.clone(),
                last_seen_seq: 0,
                processor,
            },
        );
        (display_name, color)
    }

    /// Drop `instance_id`'s replica from every path it touched, removing any
    /// path that has no replicas left, and emit the resulting delta.
    pub fn remove_agent(&mut self, instance_id: &str) {
        if self.agents.remove(instance_id).is_none() {
            return;
        }
        let touched: HashSet<String> = self
            .merged
            .iter()
            .filter(|(_, node)| node.replicas.contains_key(instance_id))
            .map(|(path, _)| path.clone())
            .collect();
        for path in &touched {
            if let Some(node) = self.merged.get_mut(path) {
                node.replicas.remove(instance_id);
            }
        }
        let (updates, removed) = self.recompute(touched);
        self.emit_delta(updates, removed);
    }

    /// Decode one ndJSON line from an agent connection and apply it.
    fn apply_line(&mut self, instance_id: &str, line: &str) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }
        let v: serde_json::Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(e) => {
                debug!(instance_id = instance_id, error = %e, "malformed agent line");
                return;
            }
        };
        match v.get("type").and_then(|t| t.as_str()) {
            Some("snapshot") => match serde_json::from_value::<Snapshot>(v) {
                Ok(snap) => self.apply_snapshot(instance_id, snap),
                Err(e) => warn!(instance_id = instance_id, error = %e, "failed to parse snapshot"),
            },
            Some("delta") => match serde_json::from_value::<Delta>(v) {
                Ok(delta) => self.apply_delta(instance_id, delta),
                Err(e) => warn!(instance_id = instance_id, error = %e, "failed to parse delta"),
            },
            // "usage" and anything else are not part of the merged file
            // graph — the orchestrator only aggregates activity state.
            _ => {}
        }
    }

    /// Drop every replica `instance_id` currently owns, then apply every
    /// node in the incoming snapshot. Paths that lose their last replica are
    /// removed now but only announced in the next outgoing `MergedDelta`.
    fn apply_snapshot(&mut self, instance_id: &str, mut snapshot: Snapshot) {
        if let Some(agent) = self.agents.get(instance_id) {
            agent.processor.process_snapshot(&mut snapshot.nodes);
        } else {
            return;
        }

        let mut touched: HashSet<String> = self
            .merged
            .iter_mut()
            .filter_map(|(path, node)| {
                node.replicas.remove(instance_id).map(|_| path.clone())
            })
            .collect();

        for (raw_path, node) in &snapshot.nodes {
            let Some(path) = normalize_path(raw_path) else {
                continue;
            };
            let entry = self.merged.entry(path.clone()).or_default();
            entry
                .replicas
                .insert(instance_id.to_string(), AgentFileState::from_node(node));
            touched.insert(path);
        }

        for path in &touched {
            if matches!(self.merged.get(path), Some(n) if n.replicas.is_empty()) {
                self.merged.remove(path);
                self.pending_removed.insert(path.clone());
            }
        }

        self.emit_snapshot();
    }

    /// Discard stale deltas (`seq` at or below what was last seen from this
    /// agent), otherwise upsert/remove per path and emit the resulting
    /// merged delta.
    fn apply_delta(&mut self, instance_id: &str, mut delta: Delta) {
        let Some(agent) = self.agents.get_mut(instance_id) else {
            return;
        };
        if delta.seq <= agent.last_seen_seq {
            debug!(instance_id = instance_id, seq = delta.seq, last_seen = agent.last_seen_seq, "discarding stale delta");
            return;
        }
        agent.last_seen_seq = delta.seq;
        agent.processor.process_delta(&mut delta.updates);

        let mut touched = HashSet::new();
        for update in &delta.updates {
            let Some(path) = normalize_path(&update.path) else {
                continue;
            };
            let entry = self.merged.entry(path.clone()).or_default();
            entry
                .replicas
                .insert(instance_id.to_string(), AgentFileState::from_update(update));
            touched.insert(path);
        }
        for raw_path in &delta.removed {
            let Some(path) = normalize_path(raw_path) else {
                continue;
            };
            if let Some(node) = self.merged.get_mut(&path) {
                node.replicas.remove(instance_id);
                touched.insert(path);
            }
        }

        let (updates, removed) = self.recompute(touched);
        self.emit_delta(updates, removed);
    }

    fn recompute(&mut self, touched: HashSet<String>) -> (Vec<MergedFileView>, Vec<String>) {
        let mut updates = Vec::new();
        let mut removed = Vec::new();
        for path in touched {
            match self.merged.get(&path) {
                Some(node) if !node.replicas.is_empty() => {
                    updates.push(derive_view(&path, &node.replicas));
                }
                _ => {
                    self.merged.remove(&path);
                    removed.push(path);
                }
            }
        }
        (updates, removed)
    }

    fn roster(&self) -> Vec<AgentRosterMember> {
        self.agents
            .iter()
            .map(|(instance_id, a)| AgentRosterMember {
                instance_id: instance_id.clone(),
                agent_type: a.agent_type.clone(),
                display_name: a.display_name.clone(),
                color: a.color.clone(),
            })
            .collect()
    }

    fn emit_snapshot(&mut self) {
        self.seq += 1;
        let nodes = self
            .merged
            .iter()
            .map(|(path, node)| (path.clone(), derive_view(path, &node.replicas)))
            .collect();
        let msg = MergedSnapshot {
            msg_type: "merged_snapshot".to_string(),
            seq: self.seq,
            nodes,
            agents: self.roster(),
        };
        if let Ok(mut json) = serde_json::to_string(&msg) {
            json.push('\n');
            let _ = self.emit_tx.send(json);
        }
    }

    fn emit_delta(&mut self, updates: Vec<MergedFileView>, mut removed: Vec<String>) {
        if !self.pending_removed.is_empty() {
            removed.extend(self.pending_removed.drain());
        }
        if updates.is_empty() && removed.is_empty() {
            return;
        }
        self.seq += 1;
        let msg = MergedDelta {
            msg_type: "merged_delta".to_string(),
            seq: self.seq,
            updates,
            removed,
            agents: self.roster(),
        };
        if let Ok(mut json) = serde_json::to_string(&msg) {
            json.push('\n');
            let _ = self.emit_tx.send(json);
        }
    }

    /// Current derived state, for a consumer that subscribes mid-stream and
    /// needs to catch up before processing further deltas.
    pub fn snapshot(&self) -> MergedSnapshot {
        let nodes = self
            .merged
            .iter()
            .map(|(path, node)| (path.clone(), derive_view(path, &node.replicas)))
            .collect();
        MergedSnapshot {
            msg_type: "merged_snapshot".to_string(),
            seq: self.seq,
            nodes,
            agents: self.roster(),
        }
    }
}
