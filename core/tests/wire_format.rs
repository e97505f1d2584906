//! Black-box validation of the TCP wire format described in spec §3/§6.
//!
//! Spins up the full server stack (`ContextTracker` + tick loop + TCP
//! server), connects one or more TCP clients, and checks every message
//! type and field the wire carries: `snapshot`, `delta`, `usage`, and the
//! `request_snapshot` control message.

use std::sync::Arc;
use std::time::Duration;

use eisen_core::session_registry::SessionRegistry;
use eisen_core::tcp::{self, ServerConfig, WireLine};
use eisen_core::tracker::{now_ms, ContextTracker};
use eisen_core::types::{Action, TrackerConfig};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};

// -----------------------------------------------------------------------
// Test harness: full server stack on an ephemeral port, with its own
// fast tick loop so delta/usage broadcasts don't wait on production
// timing.
// -----------------------------------------------------------------------

struct TestServer {
    port: u16,
    tracker: Arc<Mutex<ContextTracker>>,
    delta_tx: broadcast::Sender<WireLine>,
}

impl TestServer {
    async fn start() -> Self {
        Self::start_with_config(TrackerConfig::default()).await
    }

    async fn start_with_config(config: TrackerConfig) -> Self {
        let tracker = Arc::new(Mutex::new(ContextTracker::new(config)));
        let (delta_tx, _rx) = broadcast::channel::<WireLine>(64);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let registry = Arc::new(Mutex::new(SessionRegistry::load_from_path(
            std::env::temp_dir().join(format!("eisen-wire-test-{port}.json")),
        )));

        {
            let tracker = tracker.clone();
            let delta_tx = delta_tx.clone();
            tokio::spawn(async move {
                let _ = tcp::serve(listener, tracker, delta_tx, registry, ServerConfig::default())
                    .await;
            });
        }

        // Fast tick loop (mirrors main.rs's adaptive loop, but fixed at
        // 30ms so tests don't wait on production cadence).
        let t = tracker.clone();
        let tx = delta_tx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(30));
            loop {
                interval.tick().await;
                let mut guard = t.lock().await;
                for usage in guard.take_pending_usage() {
                    tcp::broadcast_line(&tx, &usage);
                }
                if let Some(delta) = guard.tick(now_ms()) {
                    tcp::broadcast_line(&tx, &delta);
                }
            }
        });

        Self {
            port,
            tracker,
            delta_tx,
        }
    }

    async fn connect(&self) -> TestClient {
        let stream = TcpStream::connect(("127.0.0.1", self.port)).await.unwrap();
        TestClient {
            reader: BufReader::new(stream),
        }
    }
}

struct TestClient {
    reader: BufReader<TcpStream>,
}

impl TestClient {
    /// Read one ndJSON line, parse as `serde_json::Value`.
    async fn read_msg(&mut self) -> serde_json::Value {
        let mut line = String::new();
        tokio::time::timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for message")
            .expect("read error");
        assert!(line.ends_with('\n'), "wire line must end with newline");
        serde_json::from_str(line.trim()).expect("wire line must be valid JSON")
    }

    /// Send a raw ndJSON line to the server (a control message).
    async fn send(&mut self, msg: &serde_json::Value) {
        let line = serde_json::to_string(msg).unwrap() + "\n";
        self.reader
            .get_mut()
            .write_all(line.as_bytes())
            .await
            .unwrap();
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

/// Validate snapshot wire format: fields, types, nested FileNode structure.
#[tokio::test]
async fn snapshot_wire_format() {
    let srv = TestServer::start().await;

    {
        let mut t = srv.tracker.lock().await;
        t.file_access("src/auth.ts", Action::Write);
        t.file_access("src/db.ts", Action::Read);
    }

    let mut client = srv.connect().await;
    let msg = client.read_msg().await;

    assert_eq!(msg["type"], "snapshot", "snapshot must have type=snapshot");
    assert!(msg["agent_id"].is_string(), "agent_id must be a string");
    assert!(msg["session_id"].is_string(), "session_id must be a string");
    assert!(msg["seq"].is_u64(), "seq must be u64");
    assert!(msg["nodes"].is_object(), "nodes must be an object");

    let node = &msg["nodes"]["src/auth.ts"];
    assert!(node.is_object(), "node must be an object keyed by path");
    assert_eq!(node["path"], "src/auth.ts");
    assert!(node["heat"].is_number(), "heat must be a number");
    let heat = node["heat"].as_f64().unwrap();
    assert!((0.0..=1.0).contains(&heat), "heat must be 0.0-1.0, got {heat}");
    assert!(node["in_context"].is_boolean(), "in_context must be bool");
    assert!(node["last_action"].is_string(), "last_action must be a string");
    assert!(node["turn_accessed"].is_u64(), "turn_accessed must be u64");
    assert!(node["timestamp_ms"].is_u64(), "timestamp_ms must be u64");

    assert!(msg["nodes"]["src/db.ts"].is_object());
}

/// Validate delta wire format: fields, updates array, removed array.
#[tokio::test]
async fn delta_wire_format() {
    let srv = TestServer::start().await;
    let mut client = srv.connect().await;
    let _snap = client.read_msg().await; // consume initial snapshot

    {
        let mut t = srv.tracker.lock().await;
        t.file_access("src/new.ts", Action::Search);
    }

    let msg = client.read_msg().await;
    assert_eq!(msg["type"], "delta", "expected delta message");
    assert!(msg["agent_id"].is_string(), "agent_id must be a string");
    assert!(msg["session_id"].is_string(), "session_id must be a string");
    assert!(msg["seq"].is_u64(), "seq must be u64");
    assert!(msg["updates"].is_array(), "updates must be array");
    assert!(msg["removed"].is_array(), "removed must be array");

    let updates = msg["updates"].as_array().unwrap();
    assert!(!updates.is_empty(), "should have at least one update");
    let update = &updates[0];
    assert_eq!(update["path"], "src/new.ts");
    assert!(update["heat"].is_number());
    assert!(update["in_context"].is_boolean());
    assert_eq!(update["last_action"], "search");
    assert!(update["turn_accessed"].is_u64());
}

/// Validate all Action variants serialize to the correct snake_case strings.
#[tokio::test]
async fn action_serialization() {
    let srv = TestServer::start().await;

    let actions = vec![
        ("a", Action::UserProvided, "user_provided"),
        ("b", Action::UserReferenced, "user_referenced"),
        ("c", Action::Read, "read"),
        ("d", Action::Write, "write"),
        ("e", Action::Search, "search"),
    ];

    {
        let mut t = srv.tracker.lock().await;
        for (path, action, _) in &actions {
            t.file_access(path, *action);
        }
    }

    let mut client = srv.connect().await;
    let msg = client.read_msg().await;
    assert_eq!(msg["type"], "snapshot");

    for (path, _, expected_str) in &actions {
        let node = &msg["nodes"][path];
        assert_eq!(
            node["last_action"].as_str().unwrap(),
            *expected_str,
            "Action for {path} should serialize as {expected_str}"
        );
    }
}

/// Validate request_snapshot round-trip: a subscriber gets a fresh full
/// snapshot on demand, never a partial replay.
#[tokio::test]
async fn request_snapshot_round_trip() {
    let srv = TestServer::start().await;
    let mut client = srv.connect().await;
    let snap1 = client.read_msg().await; // initial snapshot (empty)
    assert_eq!(snap1["type"], "snapshot");
    assert!(snap1["nodes"].as_object().unwrap().is_empty());

    {
        let mut t = srv.tracker.lock().await;
        t.file_access("x.rs", Action::Write);
    }

    client
        .send(&serde_json::json!({"type": "request_snapshot"}))
        .await;

    // May receive a delta first from the tick loop — drain until a
    // snapshot arrives.
    let mut snap2 = client.read_msg().await;
    while snap2["type"] != "snapshot" {
        snap2 = client.read_msg().await;
    }

    assert_eq!(snap2["type"], "snapshot");
    assert!(snap2["nodes"]["x.rs"].is_object(), "new file should be in snapshot");
}

/// Validate seq numbers are monotonically increasing across deltas.
#[tokio::test]
async fn seq_monotonic_across_deltas() {
    let srv = TestServer::start().await;
    let mut client = srv.connect().await;
    let snap = client.read_msg().await;
    let mut last_seq = snap["seq"].as_u64().unwrap();

    for i in 0..3 {
        {
            let mut t = srv.tracker.lock().await;
            t.file_access(&format!("file_{i}.rs"), Action::Read);
        }
        let msg = client.read_msg().await;
        let seq = msg["seq"].as_u64().unwrap();
        assert!(
            seq > last_seq,
            "seq must be monotonically increasing: {seq} > {last_seq}"
        );
        last_seq = seq;
    }
}

/// Validate that evicted files appear in delta.removed once cold and
/// untouched for `gc_turns` turns.
#[tokio::test]
async fn removed_files_in_delta() {
    let config = TrackerConfig {
        decay_ms: 1, // heat drops to 0 on the very first tick
        gc_turns: 1,
        compaction_threshold: 0.5,
    };
    let srv = TestServer::start_with_config(config).await;

    {
        let mut t = srv.tracker.lock().await;
        t.file_access("ephemeral.rs", Action::Read);
    }

    let mut client = srv.connect().await;

    let mut found_removed = false;
    for _ in 0..40 {
        let msg = client.read_msg().await;
        if msg["type"] == "delta" {
            if let Some(removed) = msg["removed"].as_array() {
                if removed.iter().any(|v| v.as_str() == Some("ephemeral.rs")) {
                    found_removed = true;
                    break;
                }
            }
        }
    }
    assert!(found_removed, "file should appear in delta.removed after decay + gc_turns");
}

/// Validate usage messages are broadcast via the tick loop.
#[tokio::test]
async fn usage_broadcast_via_tick_loop() {
    let srv = TestServer::start().await;
    let mut client = srv.connect().await;
    let _snap = client.read_msg().await;

    {
        let mut t = srv.tracker.lock().await;
        t.usage_update(120_000, 200_000);
    }

    let msg = client.read_msg().await;
    assert_eq!(msg["type"], "usage");
    assert_eq!(msg["used"], 120_000);
    assert_eq!(msg["size"], 200_000);
}

/// Validate usage message wire format when broadcast directly, without cost.
#[tokio::test]
async fn usage_message_wire_format() {
    let srv = TestServer::start().await;
    let mut client = srv.connect().await;
    let _snap = client.read_msg().await;

    let usage = eisen_core::types::UsageMessage::new("agent-1", "sess-1", 45_000, 200_000, None);
    tcp::broadcast_line(&srv.delta_tx, &usage);

    let msg = client.read_msg().await;
    assert_eq!(msg["type"], "usage");
    assert_eq!(msg["agent_id"], "agent-1");
    assert_eq!(msg["session_id"], "sess-1");
    assert_eq!(msg["used"], 45_000);
    assert_eq!(msg["size"], 200_000);
    assert!(msg.get("cost").is_none(), "cost should be omitted when not provided");
}

/// Validate usage message with cost field present.
#[tokio::test]
async fn usage_message_with_cost() {
    let srv = TestServer::start().await;
    let mut client = srv.connect().await;
    let _snap = client.read_msg().await;

    let usage = eisen_core::types::UsageMessage::new(
        "agent-1",
        "sess-1",
        45_000,
        200_000,
        Some(eisen_core::types::Cost {
            amount: 0.04,
            currency: "USD".to_string(),
        }),
    );
    tcp::broadcast_line(&srv.delta_tx, &usage);

    let msg = client.read_msg().await;
    assert_eq!(msg["type"], "usage");
    assert_eq!(msg["cost"]["amount"], 0.04);
    assert_eq!(msg["cost"]["currency"], "USD");
}

/// Validate that multiple subscribers each get their own fresh snapshot on
/// connect, reflecting the same underlying state.
#[tokio::test]
async fn multiple_clients_same_data() {
    let srv = TestServer::start().await;

    {
        let mut t = srv.tracker.lock().await;
        t.file_access("shared.rs", Action::Write);
    }

    let mut c1 = srv.connect().await;
    let mut c2 = srv.connect().await;

    let snap1 = c1.read_msg().await;
    let snap2 = c2.read_msg().await;

    assert_eq!(snap1["type"], "snapshot");
    assert_eq!(snap2["type"], "snapshot");
    assert!(snap1["nodes"]["shared.rs"].is_object());
    assert!(snap2["nodes"]["shared.rs"].is_object());
}

/// Validate ndJSON framing: each message is exactly one line.
#[tokio::test]
async fn ndjson_framing() {
    let srv = TestServer::start().await;
    let mut client = srv.connect().await;

    let mut line = String::new();
    client.reader.read_line(&mut line).await.unwrap();

    let parsed: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
    assert_eq!(parsed["type"], "snapshot");

    assert!(line.ends_with('\n'));
    assert!(!line.ends_with("\n\n"));
    assert_eq!(line.matches('\n').count(), 1);
}
