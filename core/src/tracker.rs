use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::types::{
    Action, Cost, Delta, FileNode, NodeUpdate, Snapshot, TrackerConfig, UsageMessage,
    DELTA_RING_CAPACITY, HEAT_EPSILON,
};

/// Current wall-clock time in milliseconds since Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// `delta_since(last_seq)` reports this when `last_seq` has aged out of the
/// ring buffer — the caller must take a fresh `snapshot()` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaleCursor;

/// One coalesced emission recorded in the replay ring: the `seq` it was
/// emitted at, plus the updates/removals produced by that tick.
#[derive(Debug, Clone)]
struct RingEntry {
    seq: u64,
    updates: Vec<NodeUpdate>,
    removed: Vec<String>,
}

/// ContextTracker is the stateful core of Eisen.
///
/// Maintains a map of file nodes, applies linear wall-clock heat decay on
/// each tick, garbage-collects cold untouched nodes, and produces both
/// snapshots and replayable deltas. Not internally synchronized — the
/// caller (the proxy) owns locking via `Arc<Mutex<ContextTracker>>`.
pub struct ContextTracker {
    agent_id: String,
    session_id: String,
    files: HashMap<String, FileNode>,
    seq: u64,
    current_turn: u64,
    last_tick_ms: Option<u64>,
    last_used_tokens: u32,
    context_size: u32,
    config: TrackerConfig,
    changed_paths: HashSet<String>,
    ring: VecDeque<RingEntry>,
    pending_usage: Vec<UsageMessage>,
    pending_terminal_output_ids: HashSet<u64>,
}

impl ContextTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            agent_id: String::new(),
            session_id: String::new(),
            files: HashMap::new(),
            seq: 0,
            current_turn: 0,
            last_tick_ms: None,
            last_used_tokens: 0,
            context_size: 0,
            config,
            changed_paths: HashSet::new(),
            ring: VecDeque::new(),
            pending_usage: Vec::new(),
            pending_terminal_output_ids: HashSet::new(),
        }
    }

    pub fn set_agent_id(&mut self, id: String) {
        self.agent_id = id;
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn set_session_id(&mut self, id: String) {
        self.session_id = id;
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn add_pending_terminal_output(&mut self, id: u64) {
        self.pending_terminal_output_ids.insert(id);
    }

    pub fn take_pending_terminal_output(&mut self, id: u64) -> bool {
        self.pending_terminal_output_ids.remove(&id)
    }

    /// Snapshot of ids currently awaiting a `terminal/output` response —
    /// read by the classifier (a pure function) before it decides whether
    /// an upstream response line carries output worth extracting.
    pub fn pending_terminal_ids(&self) -> HashSet<u64> {
        self.pending_terminal_output_ids.clone()
    }

    /// Record a file access from any extraction channel. Sets `heat=1.0`,
    /// `last_action=action`, `timestamp_ms=now_ms`, `in_context` per
    /// `Action::enters_context`. Creates the node if absent.
    pub fn file_access(&mut self, path: &str, action: Action) {
        self.file_access_at(path, action, now_ms());
    }

    /// `file_access` with an explicit timestamp — used by tests and by the
    /// proxy when recording a zone denial as a synthetic access.
    pub fn file_access_at(&mut self, path: &str, action: Action, ts: u64) {
        let turn = self.current_turn;
        let node = self.files.entry(path.to_string()).or_insert_with(|| FileNode {
            path: path.to_string(),
            heat: 0.0,
            in_context: false,
            last_action: action,
            turn_accessed: 0,
            timestamp_ms: 0,
        });

        node.heat = 1.0;
        node.in_context = action.enters_context();
        node.last_action = action;
        node.turn_accessed = turn;
        node.timestamp_ms = ts;

        self.changed_paths.insert(path.to_string());
    }

    /// Record a zone violation as a heat-zero observability event — it
    /// surfaces in the next delta with the denied action but never enters
    /// context and decays away immediately.
    pub fn record_zone_violation(&mut self, path: &str, action: Action, ts: u64) {
        let turn = self.current_turn;
        let node = self.files.entry(path.to_string()).or_insert_with(|| FileNode {
            path: path.to_string(),
            heat: 0.0,
            in_context: false,
            last_action: action,
            turn_accessed: turn,
            timestamp_ms: ts,
        });
        node.last_action = action;
        node.timestamp_ms = ts;
        node.heat = 0.0;
        node.in_context = false;
        self.changed_paths.insert(path.to_string());
    }

    /// Record a token usage update from the agent. A usage drop of at
    /// least `compaction_threshold` relative to the previous report clears
    /// `in_context` on all files (heat keeps decaying independently —
    /// compaction does not zero heat).
    pub fn usage_update(&mut self, used: u32, size: u32) {
        self.usage_update_with_cost(used, size, None);
    }

    /// Same as `usage_update`, carrying an optional dollar cost alongside
    /// the token counts — the classifier populates this from `update.cost`
    /// on a `usage`-kind session update when the agent reports it.
    pub fn usage_update_with_cost(&mut self, used: u32, size: u32, cost: Option<Cost>) {
        let previous = self.last_used_tokens;
        self.last_used_tokens = used;
        self.context_size = size;

        if previous > 0 {
            let drop_ratio = 1.0 - (used as f32 / previous as f32);
            if drop_ratio >= self.config.compaction_threshold {
                self.handle_compaction();
            }
        }

        self.pending_usage.push(UsageMessage::new(
            &self.agent_id,
            &self.session_id,
            used,
            size,
            cost,
        ));
    }

    pub fn take_pending_usage(&mut self) -> Vec<UsageMessage> {
        std::mem::take(&mut self.pending_usage)
    }

    /// Force an immediate tick at the current wall-clock time — used by
    /// the classifier's end-of-turn detection to unify turn-advancement
    /// with decay instead of running them on separate axes.
    pub fn note_turn_boundary(&mut self) -> Option<Delta> {
        self.tick(now_ms())
    }

    /// Called periodically by the tick loop. Advances the turn counter,
    /// decays heat linearly by elapsed wall-clock milliseconds (skipped
    /// ticks do not inflate heat — decay is a function of `now`, not tick
    /// count), evicts nodes that are cold and untouched for `gc_turns`
    /// turns, and returns a `Delta` if anything changed.
    pub fn tick(&mut self, now: u64) -> Option<Delta> {
        self.current_turn += 1;

        let dt_ms = match self.last_tick_ms {
            Some(prev) => now.saturating_sub(prev),
            None => 0,
        };
        self.last_tick_ms = Some(now);

        if dt_ms > 0 && self.config.decay_ms > 0 {
            let decay = dt_ms as f32 / self.config.decay_ms as f32;
            for (path, node) in &mut self.files {
                if node.heat > 0.0 {
                    node.heat = (node.heat - decay).max(0.0);
                    self.changed_paths.insert(path.clone());
                }
            }
        }

        let mut removed = Vec::new();
        for (path, node) in &self.files {
            if node.heat < HEAT_EPSILON
                && self.current_turn.saturating_sub(node.turn_accessed) >= self.config.gc_turns
            {
                removed.push(path.clone());
            }
        }
        for path in &removed {
            self.files.remove(path);
            self.changed_paths.remove(path);
        }

        if self.changed_paths.is_empty() && removed.is_empty() {
            return None;
        }

        self.seq += 1;

        let mut updates = Vec::new();
        for path in self.changed_paths.drain().collect::<Vec<_>>() {
            if let Some(node) = self.files.get(&path) {
                updates.push(node.to_update());
            }
        }

        self.push_ring(self.seq, updates.clone(), removed.clone());

        Some(Delta::new(
            &self.agent_id,
            &self.session_id,
            self.seq,
            updates,
            removed,
        ))
    }

    /// Return a full snapshot of the current state at the current `seq`.
    pub fn snapshot(&mut self) -> Snapshot {
        self.seq += 1;
        let nodes: HashMap<String, FileNode> = self.files.clone();
        Snapshot::new(&self.agent_id, &self.session_id, self.seq, nodes)
    }

    /// Read-only peek at the current state — unlike `snapshot()`, does not
    /// advance `seq`. Used by the one-shot `snapshot` CLI command, which
    /// reports state without ever driving the tracker's tick loop.
    pub fn peek_snapshot(&self) -> Snapshot {
        let nodes: HashMap<String, FileNode> = self.files.clone();
        Snapshot::new(&self.agent_id, &self.session_id, self.seq, nodes)
    }

    /// Accumulated updates/removals since `last_seq`, or
    /// `Err(StaleCursor)` if `last_seq` predates the ring's retained
    /// history — the caller must then take a fresh `snapshot()`.
    pub fn delta_since(&self, last_seq: u64) -> Result<Option<Delta>, StaleCursor> {
        if last_seq >= self.seq {
            return Ok(None);
        }
        match self.ring.front() {
            Some(oldest) if last_seq + 1 >= oldest.seq => {}
            _ => return Err(StaleCursor),
        }

        let mut updates = Vec::new();
        let mut removed = Vec::new();
        let mut seen_paths: HashSet<String> = HashSet::new();
        let mut removed_seen: HashSet<String> = HashSet::new();

        // Newest-first so the latest state for a path wins.
        for entry in self.ring.iter().rev() {
            if entry.seq <= last_seq {
                continue;
            }
            for update in &entry.updates {
                if seen_paths.insert(update.path.clone()) {
                    updates.push(update.clone());
                }
            }
            for path in &entry.removed {
                if removed_seen.insert(path.clone()) {
                    removed.push(path.clone());
                }
            }
        }

        if updates.is_empty() && removed.is_empty() {
            return Ok(None);
        }

        Ok(Some(Delta::new(
            &self.agent_id,
            &self.session_id,
            self.seq,
            updates,
            removed,
        )))
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn current_turn(&self) -> u64 {
        self.current_turn
    }

    fn push_ring(&mut self, seq: u64, updates: Vec<NodeUpdate>, removed: Vec<String>) {
        self.ring.push_back(RingEntry {
            seq,
            updates,
            removed,
        });
        while self.ring.len() > DELTA_RING_CAPACITY {
            self.ring.pop_front();
        }
    }

    fn handle_compaction(&mut self) {
        for (path, node) in &mut self.files {
            if node.in_context {
                node.in_context = false;
                self.changed_paths.insert(path.clone());
            }
        }
    }

    #[cfg(test)]
    fn file(&self, path: &str) -> &FileNode {
        &self.files[path]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_tracker() -> ContextTracker {
        ContextTracker::new(TrackerConfig::default())
    }

    fn config_with(decay_ms: u64, gc_turns: u64, compaction_threshold: f32) -> TrackerConfig {
        TrackerConfig {
            decay_ms,
            gc_turns,
            compaction_threshold,
        }
    }

    #[test]
    fn session_id_default_empty() {
        let t = default_tracker();
        assert_eq!(t.session_id(), "");
    }

    #[test]
    fn set_session_id_propagates_to_snapshot() {
        let mut t = default_tracker();
        t.set_session_id("sess_123".to_string());
        let snap = t.snapshot();
        assert_eq!(snap.session_id, "sess_123");
    }

    #[test]
    fn set_session_id_propagates_to_usage() {
        let mut t = default_tracker();
        t.set_session_id("sess_xyz".to_string());
        t.usage_update(100_000, 200_000);
        let msgs = t.take_pending_usage();
        assert_eq!(msgs[0].session_id, "sess_xyz");
    }

    #[test]
    fn file_access_creates_node() {
        let mut t = default_tracker();
        t.file_access_at("/src/main.rs", Action::Read, 1_000);

        let node = t.file("/src/main.rs");
        assert_eq!(node.path, "/src/main.rs");
        assert_eq!(node.heat, 1.0);
        assert!(node.in_context);
        assert_eq!(node.last_action, Action::Read);
        assert_eq!(node.timestamp_ms, 1_000);
    }

    #[test]
    fn search_does_not_enter_context() {
        let mut t = default_tracker();
        t.file_access("/src", Action::Search);
        let node = t.file("/src");
        assert_eq!(node.heat, 1.0);
        assert!(!node.in_context);
    }

    #[test]
    fn file_access_resets_heat_and_updates_action() {
        let mut t = default_tracker();
        t.file_access_at("/src/main.rs", Action::Read, 1_000);
        t.tick(2_500);

        t.file_access_at("/src/main.rs", Action::Write, 3_000);
        let node = t.file("/src/main.rs");
        assert_eq!(node.heat, 1.0);
        assert!(node.in_context);
        assert_eq!(node.last_action, Action::Write);
    }

    #[test]
    fn empty_path() {
        let mut t = default_tracker();
        t.file_access("", Action::Read);
        assert!(t.files.contains_key(""));
    }

    #[test]
    fn unicode_file_path() {
        let mut t = default_tracker();
        let path = "/home/user/src/\u{1F600}_emoji.rs";
        t.file_access(path, Action::Write);
        assert!(t.files.contains_key(path));
    }

    #[test]
    fn tick_decays_linearly_in_wall_clock_ms() {
        let mut t = ContextTracker::new(config_with(1000, 100, 0.5));
        t.file_access_at("/a.rs", Action::Read, 0);
        t.tick(0);

        let delta = t.tick(500).unwrap();
        assert!((delta.updates[0].heat - 0.5).abs() < 0.001);

        let delta2 = t.tick(900).unwrap();
        assert!((delta2.updates[0].heat - 0.1).abs() < 0.001);
    }

    #[test]
    fn skipped_ticks_do_not_inflate_heat() {
        let mut t = ContextTracker::new(config_with(1000, 100, 0.5));
        t.file_access_at("/a.rs", Action::Read, 0);
        t.tick(0);

        let delta = t.tick(1000).unwrap();
        assert!(delta.updates[0].heat <= 0.001);
    }

    #[test]
    fn heat_never_goes_below_zero() {
        let mut t = ContextTracker::new(config_with(100, 1000, 0.5));
        t.file_access_at("/a.rs", Action::Read, 0);
        t.tick(0);
        let delta = t.tick(10_000).unwrap();
        assert_eq!(delta.updates[0].heat, 0.0);
    }

    #[test]
    fn first_tick_at_created_at_leaves_heat_at_one() {
        let mut t = default_tracker();
        t.file_access_at("/a.rs", Action::Read, 5_000);
        let delta = t.tick(5_000).unwrap();
        assert_eq!(delta.updates[0].heat, 1.0);
    }

    #[test]
    fn empty_tick_returns_none() {
        let mut t = default_tracker();
        assert!(t.tick(0).is_none());
    }

    #[test]
    fn node_evicted_after_gc_turns_once_cold() {
        let mut t = ContextTracker::new(config_with(10, 2, 0.5));
        t.file_access_at("/a.rs", Action::Read, 0);
        t.tick(0);
        assert!(t.files.contains_key("/a.rs"));

        t.tick(1000);
        assert!(!t.files.contains_key("/a.rs"));
    }

    #[test]
    fn node_not_evicted_before_gc_turns_elapsed() {
        let mut t = ContextTracker::new(config_with(10, 5, 0.5));
        t.file_access_at("/a.rs", Action::Read, 0);
        t.tick(0);
        t.tick(1000);
        assert!(t.files.contains_key("/a.rs"));
    }

    #[test]
    fn removed_path_appears_in_delta() {
        let mut t = ContextTracker::new(config_with(10, 1, 0.5));
        t.file_access_at("/a.rs", Action::Read, 0);
        t.tick(0);
        let delta = t.tick(1000).unwrap();
        assert!(delta.removed.contains(&"/a.rs".to_string()));
        assert!(!t.files.contains_key("/a.rs"));
    }

    #[test]
    fn re_access_after_evict_creates_fresh_node() {
        let mut t = ContextTracker::new(config_with(10, 1, 0.5));
        t.file_access_at("/a.rs", Action::Read, 0);
        t.tick(0);
        t.tick(1000);
        assert!(!t.files.contains_key("/a.rs"));

        t.file_access_at("/a.rs", Action::Write, 2000);
        assert!(t.files.contains_key("/a.rs"));
        assert_eq!(t.file("/a.rs").heat, 1.0);
    }

    #[test]
    fn seq_increments_on_each_tick_with_changes() {
        let mut t = default_tracker();
        t.file_access_at("/a.rs", Action::Read, 0);
        let d1 = t.tick(0).unwrap();
        assert_eq!(d1.seq, 1);

        t.file_access_at("/b.rs", Action::Write, 100);
        let d2 = t.tick(100).unwrap();
        assert_eq!(d2.seq, 2);
        assert!(d2.seq > d1.seq);
    }

    #[test]
    fn seq_does_not_increment_on_empty_tick() {
        let mut t = default_tracker();
        t.tick(0);
        assert_eq!(t.seq(), 0);
    }

    #[test]
    fn snapshot_increments_seq_and_is_monotonic_with_deltas() {
        let mut t = default_tracker();
        t.file_access_at("/a.rs", Action::Read, 0);
        let d1 = t.tick(0).unwrap();
        let snap = t.snapshot();
        assert!(snap.seq > d1.seq);
    }

    #[test]
    fn delta_since_returns_none_for_current_seq() {
        let mut t = default_tracker();
        t.file_access_at("/a.rs", Action::Read, 0);
        let d = t.tick(0).unwrap();
        assert_eq!(t.delta_since(d.seq).unwrap(), None);
    }

    #[test]
    fn delta_since_replays_accumulated_updates() {
        let mut t = default_tracker();
        t.file_access_at("/a.rs", Action::Read, 0);
        let d1 = t.tick(0).unwrap();

        t.file_access_at("/b.rs", Action::Write, 100);
        let _d2 = t.tick(100).unwrap();

        t.file_access_at("/c.rs", Action::Search, 200);
        let _d3 = t.tick(200).unwrap();

        let replay = t.delta_since(d1.seq).unwrap().unwrap();
        let paths: HashSet<_> = replay.updates.iter().map(|u| u.path.clone()).collect();
        assert!(paths.contains("/b.rs"));
        assert!(paths.contains("/c.rs"));
        assert!(!paths.contains("/a.rs"));
    }

    #[test]
    fn delta_since_stale_cursor_when_seq_too_old() {
        let mut t = default_tracker();
        for i in 0..(DELTA_RING_CAPACITY + 5) {
            t.file_access_at(&format!("/f{i}.rs"), Action::Read, i as u64);
            t.tick(i as u64);
        }
        assert_eq!(t.delta_since(1), Err(StaleCursor));
    }

    #[test]
    fn delta_since_on_tracker_with_no_history_is_ok_none_at_seq_zero() {
        let t = default_tracker();
        assert_eq!(t.delta_since(0), Ok(None));
    }

    #[test]
    fn compaction_evicts_context_flag_but_not_heat() {
        let mut t = default_tracker();
        t.file_access_at("/a.rs", Action::Read, 0);
        t.usage_update(180_000, 200_000);
        t.usage_update(45_000, 200_000);

        let node = t.file("/a.rs");
        assert!(!node.in_context);
        assert_eq!(node.heat, 1.0);
    }

    #[test]
    fn no_compaction_on_small_usage_drop() {
        let mut t = default_tracker();
        t.file_access("/a.rs", Action::Read);
        t.usage_update(100_000, 200_000);
        t.usage_update(80_000, 200_000);
        assert!(t.file("/a.rs").in_context);
    }

    #[test]
    fn compaction_on_first_usage_is_ignored() {
        let mut t = default_tracker();
        t.file_access("/a.rs", Action::Read);
        t.usage_update(45_000, 200_000);
        assert!(t.file("/a.rs").in_context);
    }

    #[test]
    fn usage_update_queues_message() {
        let mut t = default_tracker();
        t.usage_update(100_000, 200_000);
        let msgs = t.take_pending_usage();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].used, 100_000);
        assert_eq!(msgs[0].msg_type, "usage");
    }

    #[test]
    fn take_pending_usage_drains() {
        let mut t = default_tracker();
        t.usage_update(100_000, 200_000);
        t.usage_update(50_000, 200_000);
        assert_eq!(t.take_pending_usage().len(), 2);
        assert!(t.take_pending_usage().is_empty());
    }

    #[test]
    fn multiple_file_accesses_coalesced_into_single_delta() {
        let mut t = default_tracker();
        t.file_access_at("/a.rs", Action::Read, 0);
        t.file_access_at("/b.rs", Action::Write, 0);
        t.file_access_at("/c.rs", Action::Search, 0);

        let delta = t.tick(0).unwrap();
        assert_eq!(delta.updates.len(), 3);
    }

    #[test]
    fn same_file_accessed_multiple_times_between_ticks() {
        let mut t = default_tracker();
        t.file_access_at("/a.rs", Action::Read, 0);
        t.file_access_at("/a.rs", Action::Write, 0);
        t.file_access_at("/a.rs", Action::Search, 0);
        t.file_access_at("/a.rs", Action::UserProvided, 0);

        let delta = t.tick(0).unwrap();
        assert_eq!(delta.updates.len(), 1);
        assert_eq!(delta.updates[0].last_action, Action::UserProvided);
        assert_eq!(delta.updates[0].heat, 1.0);
    }

    #[test]
    fn thousand_nodes_tick() {
        let mut t = ContextTracker::new(config_with(1000, 1000, 0.5));
        for i in 0..1000 {
            t.file_access_at(&format!("/file_{i:04}.rs"), Action::Read, 0);
        }
        let delta = t.tick(0).unwrap();
        assert_eq!(delta.updates.len(), 1000);
    }

    #[test]
    fn zone_violation_recorded_with_zero_heat() {
        let mut t = default_tracker();
        t.record_zone_violation("/secret.rs", Action::Write, 1000);
        let node = t.file("/secret.rs");
        assert_eq!(node.heat, 0.0);
        assert!(!node.in_context);
        assert_eq!(node.last_action, Action::Write);
    }
}
