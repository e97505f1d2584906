//! Context extraction from ACP JSON-RPC messages using typed schema types.
//!
//! Parses each ndJSON line, checks the `method` field against known ACP
//! methods, then deserializes `params` into the corresponding typed struct
//! from `agent-client-protocol-schema`. Every function here is a pure
//! function of its inputs — it never touches a `ContextTracker`. It returns
//! `Extracted` events instead, so the caller (`proxy.rs`) can run a zone
//! check against each access before deciding whether to forward the line or
//! apply it to the tracker at all.
//!
//! ## Channels Covered
//!
//! | # | Method                | Direction       | Typed Params                |
//! |---|----------------------|-----------------|----------------------------|
//! | 1 | `session/prompt`     | Editor → Agent  | `PromptRequest`            |
//! | 2 | `session/prompt`     | Editor → Agent  | `PromptRequest`            |
//! | 5 | `session/update`     | Agent → Editor  | `SessionNotification`      |
//! | 5u| `session/update`     | Agent → Editor  | raw `update.kind == "usage"` |
//! | 6 | `fs/read_text_file`  | Agent → Editor  | `ReadTextFileRequest`      |
//! | 7 | `fs/write_text_file` | Agent → Editor  | `WriteTextFileRequest`     |
//!
//! ## End-Turn Detection
//!
//! JSON-RPC responses to `session/prompt` carry a `stopReason` field. We
//! detect these and return `Extracted::EndTurn`, which the caller applies
//! via `tracker.note_turn_boundary()`.

use std::collections::HashSet;

use agent_client_protocol_schema::{
    ContentBlock, EmbeddedResourceResource, PromptRequest, ReadTextFileRequest,
    SessionNotification, SessionUpdate, ToolCall, ToolCallContent, ToolCallUpdate, ToolKind,
    WriteTextFileRequest, AGENT_METHOD_NAMES, CLIENT_METHOD_NAMES,
};
use tracing::{debug, warn};

use crate::types::{Action, Cost, FileAccess};

/// One event produced by classifying a single ACP line. The caller applies
/// these to a `ContextTracker` after any zone check has had a chance to veto
/// the accesses in the batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Extracted {
    /// A file was read, written, searched, or referenced.
    Access(FileAccess),
    /// An ACP session id was auto-detected from a `session/new` response.
    SessionId(String),
    /// A `PromptResponse` with a `stopReason` was observed — advance the
    /// turn counter.
    EndTurn,
    /// A `terminal/output` request with this JSON-RPC id was sent
    /// downstream; its eventual response may carry file paths.
    TrackTerminalOutput(u64),
    /// A `session/update` notification with `update.kind == "usage"` —
    /// carries the agent's self-reported token usage and, optionally, cost.
    Usage { used: u32, size: u32, cost: Option<Cost> },
}

// ---------------------------------------------------------------------------
// Public entry points — called by proxy.rs for each forwarded line
// ---------------------------------------------------------------------------

/// Classify an editor → agent message line.
///
/// Handles channels #1 (embedded resource) and #2 (resource link) via
/// `session/prompt`, plus responses to previously-tracked `terminal/output`
/// requests (`pending_terminal_ids` holds the ids still awaiting a reply).
pub fn extract_upstream(line: &str, pending_terminal_ids: &HashSet<u64>) -> Vec<Extracted> {
    let v: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(_) => return Vec::new(),
    };

    // Check for terminal/output responses (no "method", have "result" with "output").
    if v.get("method").is_none() {
        if let Some(id) = v.get("id").and_then(|i| i.as_u64()) {
            if pending_terminal_ids.contains(&id) {
                if let Some(output) = v
                    .get("result")
                    .and_then(|r| r.get("output"))
                    .and_then(|o| o.as_str())
                {
                    return extract_paths_from_terminal_output(output);
                }
            }
        }
        return Vec::new();
    }

    let method = match v.get("method").and_then(|m| m.as_str()) {
        Some(m) => m,
        None => return Vec::new(),
    };

    debug!(method, "upstream ACP message");

    if method == AGENT_METHOD_NAMES.session_prompt {
        if let Some(params) = v.get("params") {
            return match serde_json::from_value::<PromptRequest>(params.clone()) {
                Ok(req) => {
                    debug!(prompt_blocks = req.prompt.len(), "extracting from session/prompt");
                    extract_from_prompt(&req)
                }
                Err(e) => {
                    warn!(method, error = %e, "failed to deserialize PromptRequest");
                    Vec::new()
                }
            };
        }
    }

    Vec::new()
}

/// Classify an agent → editor message line.
///
/// Handles:
/// - Channel #5: `session/update` (tool_call / tool_call_update)
/// - Channel #6: `fs/read_text_file`
/// - Channel #7: `fs/write_text_file`
/// - `terminal/output` requests (tracked so their response can be classified
///   by `extract_upstream` later)
/// - JSON-RPC responses carrying `sessionId` or `stopReason`
///
/// `has_session_id` tells the classifier whether the tracker already has a
/// session id (a CLI-provided id takes priority over auto-detection).
pub fn extract_downstream(line: &str, has_session_id: bool) -> Vec<Extracted> {
    let v: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(_) => return Vec::new(),
    };

    // --- JSON-RPC responses (no "method", have "result") ---
    if v.get("method").is_none() {
        let mut out = Vec::new();
        if let Some(result) = v.get("result") {
            // Auto-detect sessionId from session/new response:
            // {"jsonrpc":"2.0","id":1,"result":{"sessionId":"sess_abc123"}}
            if !has_session_id {
                if let Some(sid) = result.get("sessionId").and_then(|s| s.as_str()) {
                    tracing::info!(session_id = sid, "auto-detected ACP session ID");
                    out.push(Extracted::SessionId(sid.to_string()));
                }
            }
            // Detect PromptResponse by the presence of result.stopReason.
            if let Some(stop_reason) = result.get("stopReason").and_then(|s| s.as_str()) {
                debug!(stop_reason, "end-of-turn detected from PromptResponse");
                out.push(Extracted::EndTurn);
            }
        } else {
            debug!("downstream JSON-RPC response (no result)");
        }
        return out;
    }

    let method = match v.get("method").and_then(|m| m.as_str()) {
        Some(m) => m,
        None => return Vec::new(),
    };

    debug!(method, "downstream ACP message");

    if method == CLIENT_METHOD_NAMES.session_update {
        if let Some(params) = v.get("params") {
            // `usage` is not a variant of the typed `SessionUpdate` enum —
            // it's a lightweight, untyped kind the agent may emit alongside
            // the richer tool-call updates. Check for it before attempting
            // the typed deserialization, which would otherwise just log a
            // deserialize failure and drop the line.
            if let Some(usage) = extract_usage_update(params) {
                return vec![usage];
            }
            return match serde_json::from_value::<SessionNotification>(params.clone()) {
                Ok(notif) => {
                    debug!(
                        update_type = format!("{:?}", std::mem::discriminant(&notif.update)).as_str(),
                        "extracting from session/update"
                    );
                    extract_from_session_update(&notif.update)
                }
                Err(e) => {
                    warn!(method, error = %e, "failed to deserialize SessionNotification");
                    Vec::new()
                }
            };
        }
    } else if method == CLIENT_METHOD_NAMES.fs_read_text_file {
        if let Some(params) = v.get("params") {
            return match serde_json::from_value::<ReadTextFileRequest>(params.clone()) {
                Ok(req) => {
                    let path = req.path.to_string_lossy().to_string();
                    debug!(path = path.as_str(), action = "read", "fs/read_text_file");
                    vec![Extracted::Access(FileAccess::new(path, Action::Read))]
                }
                Err(e) => {
                    warn!(method, error = %e, "failed to deserialize ReadTextFileRequest");
                    Vec::new()
                }
            };
        }
    } else if method == CLIENT_METHOD_NAMES.terminal_output {
        if let Some(id) = v.get("id").and_then(|i| i.as_u64()) {
            debug!(id, "tracking terminal/output request");
            return vec![Extracted::TrackTerminalOutput(id)];
        }
    } else if method == CLIENT_METHOD_NAMES.fs_write_text_file {
        if let Some(params) = v.get("params") {
            return match serde_json::from_value::<WriteTextFileRequest>(params.clone()) {
                Ok(req) => {
                    let path = req.path.to_string_lossy().to_string();
                    debug!(path = path.as_str(), action = "write", "fs/write_text_file");
                    vec![Extracted::Access(FileAccess::new(path, Action::Write))]
                }
                Err(e) => {
                    warn!(method, error = %e, "failed to deserialize WriteTextFileRequest");
                    Vec::new()
                }
            };
        }
    }

    Vec::new()
}

// ---------------------------------------------------------------------------
// Internal extraction helpers
// ---------------------------------------------------------------------------

/// Extract file paths from a `session/prompt` request.
///
/// - Channel #1: `ContentBlock::Resource` → embedded file content → `UserProvided`
/// - Channel #2: `ContentBlock::ResourceLink` → file reference → `UserReferenced`
fn extract_from_prompt(req: &PromptRequest) -> Vec<Extracted> {
    let mut out = Vec::new();
    for block in &req.prompt {
        match block {
            ContentBlock::Resource(embedded) => {
                let uri = match &embedded.resource {
                    EmbeddedResourceResource::TextResourceContents(text) => &text.uri,
                    EmbeddedResourceResource::BlobResourceContents(blob) => &blob.uri,
                    _ => continue, // future variants
                };
                if let Some(path) = uri_to_path(uri) {
                    debug!(path = path.as_str(), action = "user_provided", "prompt: embedded resource");
                    out.push(Extracted::Access(FileAccess::new(path, Action::UserProvided)));
                }
            }
            ContentBlock::ResourceLink(link) => {
                if let Some(path) = uri_to_path(&link.uri) {
                    debug!(path = path.as_str(), action = "user_referenced", "prompt: resource link");
                    out.push(Extracted::Access(FileAccess::new(path, Action::UserReferenced)));
                }
            }
            _ => {} // Text, Image, Audio — no file paths
        }
    }
    out
}

/// Recognize `{"update": {"kind": "usage", "used": N, "size": N, "cost": {...}}}`
/// inside a `session/update` notification's raw params. Returns `None` for
/// any other `update.kind`, including ones the typed `SessionUpdate` enum
/// already covers.
fn extract_usage_update(params: &serde_json::Value) -> Option<Extracted> {
    let update = params.get("update")?;
    if update.get("kind").and_then(|k| k.as_str()) != Some("usage") {
        return None;
    }
    let used = update.get("used").and_then(|u| u.as_u64())? as u32;
    let size = update.get("size").and_then(|s| s.as_u64())? as u32;
    let cost = update.get("cost").and_then(|c| {
        let amount = c.get("amount").and_then(|a| a.as_f64())?;
        let currency = c.get("currency").and_then(|c| c.as_str())?.to_string();
        Some(Cost { amount, currency })
    });
    debug!(used, size, "session/update: usage");
    Some(Extracted::Usage { used, size, cost })
}

/// Extract file paths from a `session/update` notification.
///
/// - Channel #5a: `SessionUpdate::ToolCall` → new tool call with locations
/// - Channel #5b: `SessionUpdate::ToolCallUpdate` → update with optional locations
fn extract_from_session_update(update: &SessionUpdate) -> Vec<Extracted> {
    match update {
        SessionUpdate::ToolCall(tc) => extract_from_tool_call(tc),
        SessionUpdate::ToolCallUpdate(tcu) => extract_from_tool_call_update(tcu),
        _ => Vec::new(), // AgentMessageChunk, Plan, etc. — no file context
    }
}

/// Extract file locations from a new `ToolCall`.
fn extract_from_tool_call(tc: &ToolCall) -> Vec<Extracted> {
    let action = tool_kind_to_action(&tc.kind);
    debug!(
        tool_call_id = %tc.tool_call_id.0,
        title = tc.title.as_str(),
        kind = format!("{:?}", tc.kind).as_str(),
        locations = tc.locations.len(),
        content_blocks = tc.content.len(),
        "tool_call"
    );

    let mut out = Vec::new();
    for loc in &tc.locations {
        let path = loc.path.to_string_lossy().to_string();
        debug!(path = path.as_str(), action = format!("{:?}", action).as_str(), "tool_call location");
        out.push(Extracted::Access(FileAccess::new(path, action)));
    }
    out.extend(extract_diff_paths(&tc.content, Action::Write));
    if matches!(tc.kind, ToolKind::Search | ToolKind::Execute) {
        out.extend(extract_search_result_paths(&tc.content));
    }
    if matches!(tc.kind, ToolKind::Execute) {
        out.extend(extract_shell_write_paths(&tc.title));
    }
    out
}

/// Extract file locations from a `ToolCallUpdate`.
fn extract_from_tool_call_update(tcu: &ToolCallUpdate) -> Vec<Extracted> {
    let action = tcu
        .fields
        .kind
        .as_ref()
        .map(tool_kind_to_action)
        .unwrap_or(Action::Read);
    let is_search_or_execute = tcu
        .fields
        .kind
        .as_ref()
        .map(|k| matches!(k, ToolKind::Search | ToolKind::Execute))
        .unwrap_or(false);
    let loc_count = tcu.fields.locations.as_ref().map(|l| l.len()).unwrap_or(0);
    let content_count = tcu.fields.content.as_ref().map(|c| c.len()).unwrap_or(0);
    debug!(
        tool_call_id = %tcu.tool_call_id.0,
        action = format!("{:?}", action).as_str(),
        locations = loc_count,
        content_blocks = content_count,
        "tool_call_update"
    );

    let mut out = Vec::new();
    if let Some(locations) = &tcu.fields.locations {
        for loc in locations {
            let path = loc.path.to_string_lossy().to_string();
            debug!(path = path.as_str(), action = format!("{:?}", action).as_str(), "tool_call_update location");
            out.push(Extracted::Access(FileAccess::new(path, action)));
        }
    }
    if let Some(content) = &tcu.fields.content {
        out.extend(extract_diff_paths(content, Action::Write));
        if is_search_or_execute {
            out.extend(extract_search_result_paths(content));
        }
    }
    out
}

/// Extract file paths from `ToolCallContent::Diff` blocks.
///
/// Diffs always represent file modifications, so action is `Write`.
fn extract_diff_paths(content: &[ToolCallContent], action: Action) -> Vec<Extracted> {
    let mut out = Vec::new();
    for item in content {
        if let ToolCallContent::Diff(diff) = item {
            let path = diff.path.to_string_lossy().to_string();
            debug!(path = path.as_str(), "diff content block");
            out.push(Extracted::Access(FileAccess::new(path, action)));
        }
    }
    out
}

/// Extract file paths from the text content of search tool results.
///
/// Search tools (grep, glob, find, etc.) return results as text where each
/// line typically starts with an absolute file path. We extract these paths
/// and track them as `Action::Search` so they appear in the context graph.
fn extract_search_result_paths(content: &[ToolCallContent]) -> Vec<Extracted> {
    let mut out = Vec::new();
    for item in content {
        let text = match item {
            ToolCallContent::Content(c) => match &c.content {
                ContentBlock::Text(t) => &t.text,
                _ => continue,
            },
            _ => continue,
        };
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(path) = extract_path_from_line(line) {
                if std::path::Path::new(&path).extension().is_some() {
                    debug!(path = path.as_str(), "search result file");
                    out.push(Extracted::Access(FileAccess::new(path, Action::Search)));
                }
            }
        }
    }
    out
}

/// Try to extract an absolute file path from a search output line.
///
/// Handles common formats:
/// - `/path/to/file.rs`           (glob / find output)
/// - `/path/to/file.rs:42:…`      (grep / ripgrep output)
fn extract_path_from_line(line: &str) -> Option<String> {
    if !line.starts_with('/') {
        return None;
    }
    let path = match line.find(':') {
        Some(idx) => &line[..idx],
        None => line,
    };
    let path = path.trim();
    if path.len() > 1 {
        Some(path.to_string())
    } else {
        None
    }
}

/// Extract file write paths from shell command titles.
///
/// Detects redirect patterns like `cat > file`, `echo >> file`, `tee file`.
fn extract_shell_write_paths(title: &str) -> Vec<Extracted> {
    let mut out = Vec::new();
    for part in title.split("&&").chain(title.split(';')) {
        let part = part.trim();
        if let Some(path) = extract_redirect_target(part) {
            debug!(path = path.as_str(), "shell write target");
            out.push(Extracted::Access(FileAccess::new(path, Action::Write)));
        }
    }
    out
}

/// Extract the file path from a shell redirect (`>` or `>>`).
fn extract_redirect_target(cmd: &str) -> Option<String> {
    let after = if let Some(idx) = cmd.rfind(">>") {
        cmd[idx + 2..].trim()
    } else if let Some(idx) = cmd.rfind('>') {
        cmd[idx + 1..].trim()
    } else {
        return None;
    };
    let token = after.split_whitespace().next()?;
    if token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

/// Extract file paths from terminal output text (find, grep, ls, etc.).
fn extract_paths_from_terminal_output(output: &str) -> Vec<Extracted> {
    let mut out = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(path) = extract_path_from_line(line) {
            debug!(path = path.as_str(), "terminal output file");
            out.push(Extracted::Access(FileAccess::new(path, Action::Search)));
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Mapping helpers
// ---------------------------------------------------------------------------

/// Map an ACP `ToolKind` to our internal `Action` type.
pub fn tool_kind_to_action(kind: &ToolKind) -> Action {
    match kind {
        ToolKind::Read => Action::Read,
        ToolKind::Edit | ToolKind::Delete | ToolKind::Move => Action::Write,
        ToolKind::Search => Action::Search,
        // Execute, Fetch, Think, SwitchMode, Other — no file-level action
        _ => Action::Read,
    }
}

/// Convert a `file://` URI to a filesystem path.
///
/// Returns `None` for non-file URIs.
pub fn uri_to_path(uri: &str) -> Option<String> {
    uri.strip_prefix("file://").map(|p| p.to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
