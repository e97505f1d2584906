//! The agent proxy — spawns the wrapped agent process and pipes ndJSON
//! lines between the editor and the agent in both directions, classifying
//! each line as it passes and enforcing the zone policy before anything is
//! forwarded.
//!
//! `upstream_task` reads parent → child (editor → agent); `downstream_task`
//! reads child → parent (agent → editor). Both apply the same framing cap
//! and zone-check-then-forward discipline.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use thiserror::Error;
use tokio::io::{self, AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::extract::{self, Extracted};
use crate::tracker::{now_ms, ContextTracker};
use crate::types::Action;
use crate::zone::{Decision, Operation, ZonePolicy};

/// Default cap on a single ndJSON line, overridable via `EISEN_MAX_LINE_BYTES`.
pub const DEFAULT_MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("line exceeded the {0} byte framing limit")]
    FramingLimitExceeded(usize),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct ProxyConfig {
    pub max_line_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

impl ProxyConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("EISEN_MAX_LINE_BYTES") {
            if let Ok(parsed) = v.parse() {
                cfg.max_line_bytes = parsed;
            }
        }
        cfg
    }
}

pub fn spawn_agent(command: &str, args: &[String]) -> Result<Child> {
    let child = Command::new(command)
        .args(args)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::inherit())
        .kill_on_drop(true)
        .spawn()?;
    Ok(child)
}

/// Send SIGTERM, wait up to 5s for exit, then SIGKILL. Matches the
/// concurrency model's shutdown sequencing.
pub async fn shutdown_child(mut child: Child) -> Result<std::process::ExitStatus> {
    if let Some(pid) = child.id() {
        // SAFETY: pid is a valid process id owned by this Child; kill() with
        // SIGTERM is a plain signal send, no memory is touched.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
    match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
        Ok(status) => Ok(status?),
        Err(_) => {
            warn!("child did not exit within 5s of SIGTERM, sending SIGKILL");
            child.start_kill()?;
            Ok(child.wait().await?)
        }
    }
}

/// Read one ndJSON line with a hard byte cap, using `fill_buf`/`consume` so
/// memory use is bounded by `max_bytes` regardless of how large the
/// underlying write is — unlike `AsyncBufReadExt::read_line`, which grows
/// its buffer without limit until a newline appears.
pub(crate) async fn read_capped_line<R>(
    reader: &mut R,
    max_bytes: usize,
) -> Result<Option<String>, ProxyError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::new();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            if buf.is_empty() {
                return Ok(None);
            }
            return Ok(Some(line_from_bytes(buf)));
        }

        let newline_pos = available.iter().position(|&b| b == b'\n');
        let take = newline_pos.map(|p| p + 1).unwrap_or(available.len());

        if buf.len() + take > max_bytes {
            reader.consume(take);
            return Err(ProxyError::FramingLimitExceeded(max_bytes));
        }

        buf.extend_from_slice(&available[..take]);
        reader.consume(take);

        if newline_pos.is_some() {
            return Ok(Some(line_from_bytes(buf)));
        }
    }
}

fn line_from_bytes(buf: Vec<u8>) -> String {
    String::from_utf8_lossy(&buf)
        .trim_end_matches(['\n', '\r'])
        .to_string()
}

fn operation_for(action: Action) -> Operation {
    match action {
        Action::Write => Operation::Write,
        Action::Read | Action::Search | Action::UserProvided | Action::UserReferenced => {
            Operation::Read
        }
    }
}

fn json_rpc_id(line: &str) -> Option<serde_json::Value> {
    let v: serde_json::Value = serde_json::from_str(line).ok()?;
    v.get("id").cloned()
}

/// Apply a batch of classified events to the tracker. If any `Access` in the
/// batch is denied by the zone policy, nothing from the batch is applied
/// except a zero-heat violation record for the denied access — a line is
/// one atomic ACP message, so a denial vetoes the whole line rather than
/// partially applying it.
async fn apply_events(
    tracker: &Mutex<ContextTracker>,
    zone: Option<&ZonePolicy>,
    events: Vec<Extracted>,
) -> Option<(String, Action, String)> {
    let mut denial: Option<(String, Action, String)> = None;
    if let Some(policy) = zone {
        for ev in &events {
            if let Extracted::Access(a) = ev {
                if let Decision::Denied(reason) = policy.check(operation_for(a.action), &a.path) {
                    denial = Some((a.path.clone(), a.action, reason));
                    break;
                }
            }
        }
    }

    let mut t = tracker.lock().await;
    if let Some((path, action, reason)) = &denial {
        t.record_zone_violation(path, *action, now_ms());
        warn!(path = path.as_str(), reason = reason.as_str(), "zone violation");
        return denial;
    }

    for ev in events {
        match ev {
            Extracted::Access(a) => t.file_access(&a.path, a.action),
            Extracted::SessionId(id) => {
                if t.session_id().is_empty() {
                    t.set_session_id(id);
                }
            }
            Extracted::EndTurn => {
                t.note_turn_boundary();
            }
            Extracted::TrackTerminalOutput(id) => t.add_pending_terminal_output(id),
            Extracted::Usage { used, size, cost } => t.usage_update_with_cost(used, size, cost),
        }
    }
    None
}

/// Pipe editor → agent. Reads the editor's stdin, classifies, zone-checks,
/// forwards to the agent's stdin unless a file access in the line was
/// denied — in which case a JSON-RPC error is synthesized back to the
/// editor's stdout instead (it is the one awaiting a reply to whatever
/// request it just sent).
pub async fn upstream_task<R, W, W2>(
    tracker: Arc<Mutex<ContextTracker>>,
    zone: Option<Arc<ZonePolicy>>,
    editor_stdin: R,
    editor_stdout: W2,
    agent_stdin: Arc<Mutex<W>>,
    cancel: CancellationToken,
    max_line_bytes: usize,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    W2: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(editor_stdin);
    let mut writer = editor_stdout;
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            result = read_capped_line(&mut reader, max_line_bytes) => result,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!(error = %e, "upstream framing limit exceeded, closing");
                return Err(e.into());
            }
        };

        debug!(bytes = line.len(), "upstream line");
        let pending = tracker.lock().await.pending_terminal_ids();
        let events = extract::extract_upstream(&line, &pending);
        let denial = apply_events(&tracker, zone.as_deref(), events).await;

        match denial {
            Some((path, action, _reason)) => {
                if let Some(id) = json_rpc_id(&line) {
                    let message = format!(
                        "zone violation: {} {} not in allowed zones",
                        operation_for(action).as_str(),
                        path
                    );
                    let err = serde_json::json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": { "code": -32003, "message": message }
                    });
                    writer.write_all(err.to_string().as_bytes()).await?;
                    writer.write_all(b"\n").await?;
                }
            }
            None => {
                let mut w = agent_stdin.lock().await;
                w.write_all(line.as_bytes()).await?;
                w.write_all(b"\n").await?;
            }
        }
    }
}

/// Pipe agent → editor. Reads the agent's stdout, classifies, zone-checks,
/// forwards to real stdout unless denied — in which case a JSON-RPC error
/// is synthesized back to the agent instead (it is the one awaiting a
/// reply to the `fs/read_text_file`/`fs/write_text_file` request).
pub async fn downstream_task<R, W>(
    tracker: Arc<Mutex<ContextTracker>>,
    zone: Option<Arc<ZonePolicy>>,
    agent_stdout: R,
    agent_stdin: Arc<Mutex<W>>,
    cancel: CancellationToken,
    max_line_bytes: usize,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(agent_stdout);
    let mut writer = io::stdout();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            result = read_capped_line(&mut reader, max_line_bytes) => result,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!(error = %e, "downstream framing limit exceeded, closing");
                return Err(e.into());
            }
        };

        debug!(bytes = line.len(), "downstream line");
        let has_session_id = !tracker.lock().await.session_id().is_empty();
        let events = extract::extract_downstream(&line, has_session_id);
        let denial = apply_events(&tracker, zone.as_deref(), events).await;

        match denial {
            Some((path, action, _reason)) => {
                if let Some(id) = json_rpc_id(&line) {
                    let message = format!(
                        "zone violation: {} {} not in allowed zones",
                        operation_for(action).as_str(),
                        path
                    );
                    let err = serde_json::json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": { "code": -32003, "message": message }
                    });
                    let mut w = agent_stdin.lock().await;
                    w.write_all(err.to_string().as_bytes()).await?;
                    w.write_all(b"\n").await?;
                }
            }
            None => {
                writer.write_all(line.as_bytes()).await?;
                writer.write_all(b"\n").await?;
            }
        }
    }
}
