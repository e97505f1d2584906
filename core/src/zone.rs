//! Zone policy — glob-based allow/shared regions restricting which files an
//! agent may read or write.
//!
//! A path is readable iff it matches the allowed set or the shared set.
//! It is writable iff it matches the allowed set and is not shared-only
//! (shared files are always read-only, regardless of the allowed set).

use globset::{Glob, GlobSet, GlobSetBuilder};
use thiserror::Error;

/// Patterns that are always readable unless the caller opts out. These are
/// the usual build/package descriptors, lockfiles and lint configs that
/// every agent should be able to see but none should exclusively own.
pub const DEFAULT_SHARED_PATTERNS: &[&str] = &[
    "Cargo.toml",
    "Cargo.lock",
    "**/Cargo.toml",
    "package.json",
    "**/package.json",
    "package-lock.json",
    "pnpm-lock.yaml",
    "yarn.lock",
    "go.mod",
    "go.sum",
    "pyproject.toml",
    "requirements*.txt",
    ".eslintrc*",
    ".prettierrc*",
    "rustfmt.toml",
    ".gitignore",
    ".env.example",
    "README.md",
    "LICENSE*",
];

#[derive(Debug, Error)]
pub enum ZoneError {
    #[error("invalid glob pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },
}

/// Read/write decision for a candidate path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied(String),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

/// The operation being checked against a zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Read,
    Write,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Read => "read",
            Operation::Write => "write",
        }
    }
}

/// A compiled zone policy for one agent.
pub struct ZonePolicy {
    allowed_patterns: Vec<String>,
    shared_patterns: Vec<String>,
    allowed: GlobSet,
    shared: GlobSet,
}

impl ZonePolicy {
    /// Compile an agent's zone configuration. `allowed` defaults to
    /// everything (`**`) when empty, matching the spec's "default:
    /// everything" for `allowed_patterns`. `shared` is unioned with
    /// `DEFAULT_SHARED_PATTERNS` unless `include_default_shared` is false.
    pub fn compile(
        allowed: &[String],
        shared: &[String],
        include_default_shared: bool,
    ) -> Result<Self, ZoneError> {
        let allowed_patterns: Vec<String> = if allowed.is_empty() {
            vec!["**".to_string()]
        } else {
            allowed.to_vec()
        };

        let mut shared_patterns: Vec<String> = shared.to_vec();
        if include_default_shared {
            shared_patterns.extend(DEFAULT_SHARED_PATTERNS.iter().map(|s| s.to_string()));
        }

        let allowed_set = build_globset(&allowed_patterns)?;
        let shared_set = build_globset(&shared_patterns)?;

        Ok(Self {
            allowed_patterns,
            shared_patterns,
            allowed: allowed_set,
            shared: shared_set,
        })
    }

    /// Paths are normalized by stripping a single leading `/` so patterns
    /// written relative to the workspace root match absolute paths the
    /// same way they match relative ones (mirrors the teacher's
    /// `zone_tests.rs` "leading slash normalized" contract).
    fn normalize(path: &str) -> &str {
        path.strip_prefix('/').unwrap_or(path)
    }

    pub fn is_shared(&self, path: &str) -> bool {
        self.shared.is_match(Self::normalize(path))
    }

    pub fn is_allowed_region(&self, path: &str) -> bool {
        self.allowed.is_match(Self::normalize(path))
    }

    /// Back-compat convenience matching the teacher's `ZoneConfig::is_allowed`
    /// test contract — true iff the path is in the allowed region (ignoring
    /// shared-read-only status).
    pub fn is_allowed(&self, path: &str) -> bool {
        self.is_allowed_region(path)
    }

    /// Full read/write decision per spec §4.2.
    pub fn check(&self, op: Operation, path: &str) -> Decision {
        if Self::escapes_root(path) {
            return Decision::Denied(format!(
                "path {path:?} escapes workspace root"
            ));
        }

        let shared = self.is_shared(path);
        let allowed = self.is_allowed_region(path);

        match op {
            Operation::Read => {
                if allowed || shared {
                    Decision::Allowed
                } else {
                    Decision::Denied(format!(
                        "{} {path} not in allowed or shared zones",
                        op.as_str()
                    ))
                }
            }
            Operation::Write => {
                if allowed && !(shared && !allowed) {
                    // allowed always wins for write unless the path is
                    // shared-only (i.e. not also in the allowed set).
                    Decision::Allowed
                } else if shared {
                    Decision::Denied(format!(
                        "write {path} is shared (read-only) and not in an allowed zone"
                    ))
                } else {
                    Decision::Denied(format!("write {path} not in allowed zones"))
                }
            }
        }
    }

    fn escapes_root(path: &str) -> bool {
        std::path::Path::new(path)
            .components()
            .next()
            .map(|c| c == std::path::Component::ParentDir)
            .unwrap_or(false)
            || path.starts_with("../")
            || path == ".."
    }

    pub fn allowed_patterns(&self) -> &[String] {
        &self.allowed_patterns
    }

    pub fn shared_patterns(&self) -> &[String] {
        &self.shared_patterns
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet, ZoneError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|source| ZoneError::InvalidPattern {
            pattern: pattern.clone(),
            source,
        })?;
        builder.add(glob);
    }
    builder.build().map_err(|source| ZoneError::InvalidPattern {
        pattern: patterns.join(","),
        source,
    })
}
