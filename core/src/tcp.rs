//! TCP fan-out server: one agent process, many subscribers.
//!
//! Every connection first receives a full snapshot, then every subsequent
//! delta/usage line broadcast from the tick loop, in order, until it
//! disconnects. A connection may also send `ClientMessage` lines back — a
//! one-shot `request_snapshot`, or a JSON-RPC-flavored `rpc` call against the
//! persisted agent roster (`session_registry.rs`).
//!
//! Each subscriber owns a bounded byte-queue (`EISEN_QUEUE_BYTES`, default
//! 256 KiB). A slow socket write only ever blocks that subscriber's own
//! writer task; the tracker and every other subscriber are on independent
//! tasks and never wait on it. If the queue's pending bytes would exceed the
//! bound, the new line is dropped and the subscriber is disconnected rather
//! than allowed to grow its backlog without limit.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, warn};

use crate::session_registry::SessionRegistry;
use crate::tracker::ContextTracker;
use crate::types::{ClientMessage, RpcResponse};

pub const DEFAULT_PORT: u16 = 17320;
pub const DEFAULT_QUEUE_BYTES: usize = 256 * 1024;

/// A fully-framed ndJSON line, newline included, ready to write as-is.
pub type WireLine = String;

#[derive(Debug, Clone, Copy)]
pub struct ServerConfig {
    pub queue_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            queue_bytes: DEFAULT_QUEUE_BYTES,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(v) = std::env::var("EISEN_QUEUE_BYTES") {
            if let Ok(parsed) = v.parse() {
                cfg.queue_bytes = parsed;
            }
        }
        cfg
    }
}

/// Serialize `value`, append a newline, and broadcast it to all subscribers.
/// Callers use this for both `Delta` and `UsageMessage` lines from the tick
/// loop. Returns the number of bytes written, or 0 on a serialize failure.
pub fn broadcast_line<T: serde::Serialize>(tx: &broadcast::Sender<WireLine>, value: &T) -> usize {
    match serde_json::to_string(value) {
        Ok(mut json) => {
            json.push('\n');
            let len = json.len();
            // No receivers is not an error — subscribers may come and go.
            let _ = tx.send(json);
            len
        }
        Err(e) => {
            warn!(error = %e, "failed to serialize broadcast line");
            0
        }
    }
}

/// Accept connections forever, spawning one task per subscriber. Returns
/// only if the listener itself errors.
pub async fn serve(
    listener: TcpListener,
    tracker: Arc<Mutex<ContextTracker>>,
    delta_tx: broadcast::Sender<WireLine>,
    registry: Arc<Mutex<SessionRegistry>>,
    config: ServerConfig,
) -> Result<()> {
    loop {
        let (stream, addr) = listener.accept().await?;
        debug!(client = %addr, "subscriber connected");
        let tracker = tracker.clone();
        let delta_rx = delta_tx.subscribe();
        let registry = registry.clone();
        let queue_bytes = config.queue_bytes;
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, tracker, delta_rx, registry, queue_bytes).await {
                debug!(client = %addr, error = %e, "subscriber disconnected");
            }
        });
    }
}

/// Enqueue `line` onto the subscriber's bounded mailbox. Returns `Err(())` if
/// doing so would exceed `bound` pending bytes or the mailbox is already
/// closed — either way, the caller should treat the subscriber as dead.
fn enqueue(
    tx: &mpsc::UnboundedSender<WireLine>,
    pending: &Arc<AtomicUsize>,
    bound: usize,
    line: WireLine,
) -> Result<(), ()> {
    let len = line.len();
    let after = pending.fetch_add(len, Ordering::Relaxed) + len;
    if after > bound {
        pending.fetch_sub(len, Ordering::Relaxed);
        return Err(());
    }
    tx.send(line).map_err(|_| ())
}

async fn handle_client(
    stream: TcpStream,
    tracker: Arc<Mutex<ContextTracker>>,
    mut delta_rx: broadcast::Receiver<WireLine>,
    registry: Arc<Mutex<SessionRegistry>>,
    queue_bytes: usize,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();

    let (mailbox_tx, mut mailbox_rx) = mpsc::unbounded_channel::<WireLine>();
    let pending = Arc::new(AtomicUsize::new(0));

    let writer_pending = pending.clone();
    let writer_task = tokio::spawn(async move {
        while let Some(line) = mailbox_rx.recv().await {
            let len = line.len();
            if writer.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            writer_pending.fetch_sub(len, Ordering::Relaxed);
        }
    });

    // The snapshot-on-connect line always comes first.
    {
        let snap = {
            let mut t = tracker.lock().await;
            t.snapshot()
        };
        let mut json = serde_json::to_string(&snap)?;
        json.push('\n');
        if enqueue(&mailbox_tx, &pending, queue_bytes, json).is_err() {
            writer_task.abort();
            return Ok(());
        }
    }

    let fanout_tx = mailbox_tx.clone();
    let fanout_pending = pending.clone();
    let fanout_task = tokio::spawn(async move {
        loop {
            match delta_rx.recv().await {
                Ok(line) => {
                    if enqueue(&fanout_tx, &fanout_pending, queue_bytes, line).is_err() {
                        warn!("subscriber exceeded pending-byte bound, dropping");
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "subscriber lagged on broadcast channel");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let request_tx = mailbox_tx.clone();
    let request_pending = pending.clone();
    let request_task = tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(_) => break,
            };
            if line.trim().is_empty() {
                continue;
            }
            let msg: ClientMessage = match serde_json::from_str(&line) {
                Ok(msg) => msg,
                Err(e) => {
                    debug!(raw = line.as_str(), error = %e, "malformed client message");
                    continue;
                }
            };
            let mut response_json = match msg {
                ClientMessage::RequestSnapshot => {
                    let snap = {
                        let mut t = tracker.lock().await;
                        t.snapshot()
                    };
                    match serde_json::to_string(&snap) {
                        Ok(j) => j,
                        Err(_) => break,
                    }
                }
                ClientMessage::Rpc { id, method, params } => {
                    let response = handle_rpc_request(id, method, params, &registry).await;
                    match serde_json::to_string(&response) {
                        Ok(j) => j,
                        Err(_) => break,
                    }
                }
            };
            response_json.push('\n');
            if enqueue(&request_tx, &request_pending, queue_bytes, response_json).is_err() {
                break;
            }
        }
    });

    tokio::select! {
        _ = writer_task => {}
        _ = fanout_task => {}
        _ = request_task => {}
    }

    Ok(())
}

#[derive(Debug, Deserialize)]
struct CreateSessionParams {
    id: String,
    port: u16,
    #[serde(rename = "type")]
    agent_type: String,
    display_name: String,
    color: String,
}

#[derive(Debug, Deserialize)]
struct SessionIdParams {
    id: String,
}

async fn handle_rpc_request(
    id: String,
    method: String,
    params: Option<Value>,
    registry: &Arc<Mutex<SessionRegistry>>,
) -> RpcResponse {
    match method.as_str() {
        "list_sessions" => {
            let sessions = registry.lock().await.list_sessions();
            to_result_response(id, sessions)
        }
        "create_session" => {
            let Some(p) = parse_params::<CreateSessionParams>(params) else {
                return missing_or_bad_params(id);
            };
            let result = registry
                .lock()
                .await
                .create_session(p.id, p.port, p.agent_type, p.display_name, p.color);
            match result {
                Ok(entry) => to_result_response(id, entry),
                Err(e) => RpcResponse::error(id, 500, e.to_string()),
            }
        }
        "close_session" => {
            let Some(p) = parse_params::<SessionIdParams>(params) else {
                return missing_or_bad_params(id);
            };
            match registry.lock().await.close_session(&p.id) {
                Ok(closed) => to_result_response(id, serde_json::json!({ "closed": closed })),
                Err(e) => RpcResponse::error(id, 500, e.to_string()),
            }
        }
        "set_active_session" => {
            let Some(p) = parse_params::<SessionIdParams>(params) else {
                return missing_or_bad_params(id);
            };
            match registry.lock().await.set_active_session(p.id) {
                Ok(true) => to_result_response(id, serde_json::json!({ "active": true })),
                Ok(false) => RpcResponse::error(id, 404, "session not found".to_string()),
                Err(e) => RpcResponse::error(id, 500, e.to_string()),
            }
        }
        "get_session_state" => {
            let Some(p) = parse_params::<SessionIdParams>(params) else {
                return missing_or_bad_params(id);
            };
            match registry.lock().await.get_session_state(&p.id) {
                Some(state) => to_result_response(id, state),
                None => RpcResponse::error(id, 404, "session not found".to_string()),
            }
        }
        other => RpcResponse::error(id, 404, format!("unknown rpc method: {other}")),
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Option<Value>) -> Option<T> {
    serde_json::from_value(params?).ok()
}

fn missing_or_bad_params(id: String) -> RpcResponse {
    RpcResponse::error(id, 400, "missing or malformed params".to_string())
}

fn to_result_response<T: serde::Serialize>(id: String, value: T) -> RpcResponse {
    match serde_json::to_value(value) {
        Ok(v) => RpcResponse::result(id, v),
        Err(e) => RpcResponse::error(id, 500, e.to_string()),
    }
}
