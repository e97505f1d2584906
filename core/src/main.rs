//! eisen-core binary
//!
//! Usage:
//!   eisen-core snapshot --path <dir> [--zone-patterns <glob>...]
//!   eisen-core observe [--port N] [--agent-id ID] [--session-id ID] [--zone-patterns <glob>...] -- <agent-command> [agent-args...]
//!
//! Runs as a transparent ACP proxy between the editor (stdin/stdout) and the
//! agent process, broadcasting extracted context over TCP to connected
//! subscribers.
//!
//! Exit codes: 0 success, 2 argument error, 64 zone config error, 65 failure
//! to bind/spawn, otherwise the agent child's own exit code.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use eisen_core::proxy::{self, ProxyConfig};
use eisen_core::session_registry::SessionRegistry;
use eisen_core::tcp::{self, ServerConfig, WireLine};
use eisen_core::tracker::{now_ms, ContextTracker};
use eisen_core::types::TrackerConfig;
use eisen_core::zone::ZonePolicy;

const EXIT_ARG_ERROR: u8 = 2;
const EXIT_ZONE_CONFIG_ERROR: u8 = 64;
const EXIT_STARTUP_ERROR: u8 = 65;

struct ObserveArgs {
    port: u16,
    agent_id: Option<String>,
    session_id: Option<String>,
    zone_patterns: Vec<String>,
    agent_command: String,
    agent_args: Vec<String>,
}

enum Command {
    Snapshot {
        path: PathBuf,
        zone_patterns: Vec<String>,
    },
    Observe(ObserveArgs),
}

fn usage() -> &'static str {
    "Usage: eisen-core snapshot --path <dir> [--zone-patterns <glob>...]\n       eisen-core observe [--port N] [--agent-id ID] [--session-id ID] [--zone-patterns <glob>...] -- <agent-command> [agent-args...]"
}

fn parse_command() -> Result<Command, String> {
    let raw: Vec<String> = std::env::args().skip(1).collect();
    if raw.is_empty() {
        return Err(usage().to_string());
    }

    match raw[0].as_str() {
        "snapshot" => parse_snapshot_args(&raw),
        "observe" => parse_observe_args(&raw).map(Command::Observe),
        other => Err(format!("unknown command: {other}\n\n{}", usage())),
    }
}

fn parse_snapshot_args(raw: &[String]) -> Result<Command, String> {
    let mut path: Option<PathBuf> = None;
    let mut zone_patterns = Vec::new();
    let mut i = 1;
    while i < raw.len() {
        match raw[i].as_str() {
            "--path" => {
                i += 1;
                let v = raw.get(i).ok_or("missing value after --path")?;
                path = Some(PathBuf::from(v));
            }
            "--zone-patterns" => {
                i += 1;
                while i < raw.len() && !raw[i].starts_with("--") {
                    zone_patterns.push(raw[i].clone());
                    i += 1;
                }
                continue;
            }
            other => return Err(format!("unknown flag for snapshot: {other}")),
        }
        i += 1;
    }
    let path = path.ok_or("snapshot requires --path")?;
    Ok(Command::Snapshot { path, zone_patterns })
}

fn parse_observe_args(raw: &[String]) -> Result<ObserveArgs, String> {
    let mut port = tcp::DEFAULT_PORT;
    let mut agent_id = None;
    let mut session_id = None;
    let mut zone_patterns = Vec::new();
    let mut i = 1;

    while i < raw.len() && raw[i] != "--" {
        match raw[i].as_str() {
            "--port" => {
                i += 1;
                let v = raw.get(i).ok_or("missing value after --port")?;
                port = v.parse().map_err(|_| format!("invalid port: {v}"))?;
            }
            "--agent-id" => {
                i += 1;
                agent_id = raw.get(i).cloned();
            }
            "--session-id" => {
                i += 1;
                session_id = raw.get(i).cloned();
            }
            "--zone-patterns" => {
                i += 1;
                while i < raw.len() && raw[i] != "--" && !raw[i].starts_with("--") {
                    zone_patterns.push(raw[i].clone());
                    i += 1;
                }
                continue;
            }
            other => return Err(format!("unknown flag: {other}")),
        }
        i += 1;
    }

    if i >= raw.len() || raw[i] != "--" {
        return Err("missing '--' before agent command".to_string());
    }
    i += 1;
    if i >= raw.len() {
        return Err("missing agent command after '--'".to_string());
    }

    let agent_command = raw[i].clone();
    let agent_args = raw[i + 1..].to_vec();

    Ok(ObserveArgs {
        port,
        agent_id,
        session_id,
        zone_patterns,
        agent_command,
        agent_args,
    })
}

/// Always compiles a `ZonePolicy`, even with no `--zone-patterns` given —
/// an empty `allowed` list defaults to everything, but the default shared
/// set still loads, so `Cargo.lock`/`package.json`/`README.md`/etc. stay
/// write-protected even for the no-flag invocation.
fn compile_zone(patterns: &[String]) -> Result<Arc<ZonePolicy>, String> {
    ZonePolicy::compile(patterns, &[], true)
        .map(Arc::new)
        .map_err(|e| e.to_string())
}

fn cmd_snapshot(path: PathBuf, zone_patterns: Vec<String>) -> Result<ExitCode, anyhow::Error> {
    if let Err(e) = compile_zone(&zone_patterns) {
        eprintln!("zone config error: {e}");
        return Ok(ExitCode::from(EXIT_ZONE_CONFIG_ERROR));
    }
    debug!(path = %path.display(), "snapshot requested");
    // The CLI's snapshot command reports the state of a freshly-started
    // tracker — there is no live agent process to have recorded any
    // activity yet, so this is always the empty graph at seq 0.
    let tracker = ContextTracker::new(TrackerConfig::from_env());
    let snap = tracker.peek_snapshot();
    println!("{}", serde_json::to_string(&snap)?);
    Ok(ExitCode::SUCCESS)
}

async fn cmd_observe(args: ObserveArgs) -> Result<ExitCode, anyhow::Error> {
    let zone = match compile_zone(&args.zone_patterns) {
        Ok(z) => z,
        Err(e) => {
            eprintln!("zone config error: {e}");
            return Ok(ExitCode::from(EXIT_ZONE_CONFIG_ERROR));
        }
    };

    let mut tracker_inner = ContextTracker::new(TrackerConfig::from_env());
    if let Some(aid) = &args.agent_id {
        tracker_inner.set_agent_id(aid.clone());
    }
    if let Some(sid) = &args.session_id {
        tracker_inner.set_session_id(sid.clone());
    }
    let tracker = Arc::new(Mutex::new(tracker_inner));

    let listener = match TcpListener::bind(("127.0.0.1", args.port)).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("failed to bind TCP listener on port {}: {e}", args.port);
            return Ok(ExitCode::from(EXIT_STARTUP_ERROR));
        }
    };
    let actual_port = listener.local_addr()?.port();
    eprintln!("listening on {actual_port}");

    let (delta_tx, _rx) = broadcast::channel::<WireLine>(256);
    let registry = Arc::new(Mutex::new(SessionRegistry::load_default()));

    {
        let tracker = tracker.clone();
        let delta_tx = delta_tx.clone();
        let registry = registry.clone();
        let server_config = ServerConfig::from_env();
        tokio::spawn(async move {
            if let Err(e) = tcp::serve(listener, tracker, delta_tx, registry, server_config).await
            {
                error!(error = %e, "TCP server exited");
            }
        });
    }

    let mut child = match proxy::spawn_agent(&args.agent_command, &args.agent_args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to spawn agent {:?}: {e}", args.agent_command);
            return Ok(ExitCode::from(EXIT_STARTUP_ERROR));
        }
    };
    let agent_stdin = Arc::new(Mutex::new(
        child.stdin.take().expect("agent stdin should be piped"),
    ));
    let agent_stdout = child.stdout.take().expect("agent stdout should be piped");

    let cancel = CancellationToken::new();
    let proxy_cfg = ProxyConfig::from_env();

    let upstream = tokio::spawn(proxy::upstream_task(
        tracker.clone(),
        Some(zone.clone()),
        tokio::io::stdin(),
        tokio::io::stdout(),
        agent_stdin.clone(),
        cancel.clone(),
        proxy_cfg.max_line_bytes,
    ));
    let downstream = tokio::spawn(proxy::downstream_task(
        tracker.clone(),
        Some(zone.clone()),
        agent_stdout,
        agent_stdin,
        cancel.clone(),
        proxy_cfg.max_line_bytes,
    ));

    let tick_tracker = tracker.clone();
    let tick_tx = delta_tx.clone();
    let tick_cancel = cancel.clone();
    let tick_loop = tokio::spawn(async move {
        const ACTIVE_INTERVAL_MS: u64 = 100;
        const IDLE_INTERVAL_MS: u64 = 500;
        const IDLE_THRESHOLD: u32 = 20; // ~2s of no-ops before backing off

        let mut idle_ticks: u32 = 0;
        let mut interval =
            tokio::time::interval(std::time::Duration::from_millis(ACTIVE_INTERVAL_MS));

        loop {
            tokio::select! {
                _ = tick_cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let mut t = tick_tracker.lock().await;
            let mut had_activity = false;

            let usage_msgs = t.take_pending_usage();
            if !usage_msgs.is_empty() {
                had_activity = true;
                debug!(count = usage_msgs.len(), "broadcasting pending usage messages");
            }
            for usage in usage_msgs {
                tcp::broadcast_line(&tick_tx, &usage);
            }

            if let Some(delta) = t.tick(now_ms()) {
                had_activity = true;
                debug!(
                    seq = delta.seq,
                    updates = delta.updates.len(),
                    removed = delta.removed.len(),
                    "broadcasting delta from tick"
                );
                tcp::broadcast_line(&tick_tx, &delta);
            }
            drop(t);

            if had_activity {
                if idle_ticks >= IDLE_THRESHOLD {
                    interval =
                        tokio::time::interval(std::time::Duration::from_millis(ACTIVE_INTERVAL_MS));
                    debug!("tick loop resumed active interval (100ms)");
                }
                idle_ticks = 0;
            } else {
                idle_ticks = idle_ticks.saturating_add(1);
                if idle_ticks == IDLE_THRESHOLD {
                    interval =
                        tokio::time::interval(std::time::Duration::from_millis(IDLE_INTERVAL_MS));
                    debug!("tick loop entering idle interval (500ms)");
                }
            }
        }
    });

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            let mut term = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "failed to install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                _ = term.recv() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
            info!("shutdown signal received");
            cancel.cancel();
        }
    });

    tokio::select! {
        _ = upstream => {}
        _ = downstream => {}
    }

    cancel.cancel();
    tick_loop.abort();

    let status = proxy::shutdown_child(child).await?;
    let code = status.code().unwrap_or(1).clamp(0, 255) as u8;
    Ok(ExitCode::from(code))
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let command = match parse_command() {
        Ok(c) => c,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::from(EXIT_ARG_ERROR);
        }
    };

    let result = match command {
        Command::Snapshot { path, zone_patterns } => cmd_snapshot(path, zone_patterns),
        Command::Observe(args) => cmd_observe(args).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("eisen-core error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eisen_core::zone::{Decision, Operation};

    #[test]
    fn compile_zone_with_no_patterns_still_protects_default_shared_files() {
        let zone = compile_zone(&[]).expect("empty patterns should still compile");
        // No --zone-patterns means `allowed` defaults to everything, but the
        // default shared set must still load so build/package descriptors
        // stay write-protected even for the plain `observe -- <agent>` case.
        assert!(matches!(
            zone.check(Operation::Read, "Cargo.lock"),
            Decision::Allowed
        ));
        assert!(matches!(
            zone.check(Operation::Write, "Cargo.lock"),
            Decision::Denied(_)
        ));
        assert!(matches!(
            zone.check(Operation::Write, "src/main.rs"),
            Decision::Allowed
        ));
    }

    #[test]
    fn compile_zone_rejects_invalid_glob_as_config_error() {
        assert!(compile_zone(&["[".to_string()]).is_err());
    }
}
