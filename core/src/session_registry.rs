//! Persisted roster of agent processes the orchestrator has fanned in,
//! written atomically (temp file + rename) to `~/.eisen/sessions.json` (or
//! `$EISEN_DIR/sessions.json`).
//!
//! This tracks the *orchestrator's* agents — not the tracker's own
//! session id, which is a single opaque string per `observe` process. One
//! roster entry corresponds to one `AgentConnection` in `orchestrator.rs`.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

const DEFAULT_DIR_NAME: &str = ".eisen";
const DEFAULT_FILE_NAME: &str = "sessions.json";

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn default_eisen_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("EISEN_DIR") {
        return PathBuf::from(dir);
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(DEFAULT_DIR_NAME);
    }
    if let Ok(home) = std::env::var("USERPROFILE") {
        return PathBuf::from(home).join(DEFAULT_DIR_NAME);
    }
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(DEFAULT_DIR_NAME)
}

/// One agent the orchestrator has fanned in, as persisted to `sessions.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRosterEntry {
    pub id: String,
    pub port: u16,
    #[serde(rename = "type")]
    pub agent_type: String,
    pub display_name: String,
    pub color: String,
    pub created_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct StoredRegistry {
    #[serde(skip_serializing_if = "Option::is_none")]
    active: Option<String>,
    #[serde(default)]
    sessions: Vec<AgentRosterEntry>,
}

#[derive(Debug, Clone)]
struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn default_path() -> PathBuf {
        default_eisen_dir().join(DEFAULT_FILE_NAME)
    }

    fn load(&self) -> Result<StoredRegistry> {
        if !self.path.exists() {
            return Ok(StoredRegistry::default());
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read session store {}", self.path.display()))?;
        let parsed = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse session store {}", self.path.display()))?;
        Ok(parsed)
    }

    fn save(&self, data: &StoredRegistry) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create session store dir {}", parent.display())
            })?;
        }
        let serialized =
            serde_json::to_string_pretty(data).context("failed to serialize session registry")?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, serialized).with_context(|| {
            format!("failed to write temp session store {}", tmp_path.display())
        })?;
        if self.path.exists() {
            let _ = fs::remove_file(&self.path);
        }
        fs::rename(&tmp_path, &self.path).with_context(|| {
            format!(
                "failed to move session store {} -> {}",
                tmp_path.display(),
                self.path.display()
            )
        })?;
        Ok(())
    }
}

#[derive(Debug)]
pub struct SessionRegistry {
    sessions: HashMap<String, AgentRosterEntry>,
    active: Option<String>,
    store: SessionStore,
}

impl SessionRegistry {
    pub fn load_default() -> Self {
        Self::load(SessionStore::new(SessionStore::default_path()))
    }

    pub fn load_from_path(path: PathBuf) -> Self {
        Self::load(SessionStore::new(path))
    }

    fn load(store: SessionStore) -> Self {
        let stored = match store.load() {
            Ok(data) => data,
            Err(err) => {
                warn!(error = %err, "failed to load session registry, starting empty");
                StoredRegistry::default()
            }
        };
        let mut sessions = HashMap::new();
        for session in stored.sessions {
            sessions.insert(session.id.clone(), session);
        }
        Self {
            sessions,
            active: stored.active,
            store,
        }
    }

    fn persist(&self) -> Result<()> {
        let mut sessions: Vec<AgentRosterEntry> = self.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| a.created_ms.cmp(&b.created_ms));
        let stored = StoredRegistry {
            active: self.active.clone(),
            sessions,
        };
        self.store.save(&stored)
    }

    pub fn list_sessions(&self) -> Vec<AgentRosterEntry> {
        let mut sessions: Vec<AgentRosterEntry> = self.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| a.created_ms.cmp(&b.created_ms));
        sessions
    }

    pub fn create_session(
        &mut self,
        id: String,
        port: u16,
        agent_type: String,
        display_name: String,
        color: String,
    ) -> Result<AgentRosterEntry> {
        let entry = AgentRosterEntry {
            id: id.clone(),
            port,
            agent_type,
            display_name,
            color,
            created_ms: now_ms(),
        };
        self.sessions.insert(id, entry.clone());
        self.persist()?;
        Ok(entry)
    }

    pub fn close_session(&mut self, id: &str) -> Result<bool> {
        let removed = self.sessions.remove(id).is_some();
        if self.active.as_deref() == Some(id) {
            self.active = None;
        }
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    pub fn set_active_session(&mut self, id: String) -> Result<bool> {
        if !self.sessions.contains_key(&id) {
            return Ok(false);
        }
        self.active = Some(id);
        self.persist()?;
        Ok(true)
    }

    pub fn active_session(&self) -> Option<String> {
        self.active.clone()
    }

    pub fn get_session_state(&self, id: &str) -> Option<AgentRosterEntry> {
        self.sessions.get(id).cloned()
    }
}
