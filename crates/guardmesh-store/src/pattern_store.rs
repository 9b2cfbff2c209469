//! Append-mostly catalog of known attack fingerprints.
//!
//! The on-disk snapshot is a single JSON document:
//!
//! ```json
//! {
//!   "version": "1.0.7",
//!   "totalPatterns": 42,
//!   "lastUpdated": "2026-07-30T12:00:00Z",
//!   "source": "node-a",
//!   "categories": {
//!     "sql_injection": {
//!       "description": "...",
//!       "severity": "high",
//!       "patterns": ["UNION SELECT * FROM users --"]
//!     }
//!   }
//! }
//! ```
//!
//! Fingerprint identity is the 16-hex prefix of the SHA-256 of the
//! lowercased, trimmed pattern; no two stored fingerprints may share an
//! identity across the whole store. The identity index is rebuilt on load
//! and consulted on every insert.

use chrono::{DateTime, Utc};
use guardmesh_core::{fingerprint_id, GuardError, Result, Severity};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Shared handle to a pattern store. The store is single-writer: all
/// mutations go through whoever holds the write lock.
pub type SharedPatternStore = Arc<tokio::sync::RwLock<PatternStore>>;

/// Outcome of an insert attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    Duplicate,
}

/// One category of attack patterns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryEntry {
    pub description: String,
    pub severity: Severity,
    pub patterns: Vec<String>,
}

/// Persisted snapshot shape. Field names are camelCase for compatibility
/// with peers that exchange the raw snapshot.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snapshot {
    version: String,
    total_patterns: usize,
    last_updated: DateTime<Utc>,
    #[serde(default)]
    source: String,
    #[serde(default)]
    categories: BTreeMap<String, CategoryEntry>,
}

/// The pattern catalog.
pub struct PatternStore {
    path: PathBuf,
    version: String,
    source: String,
    last_updated: DateTime<Utc>,
    categories: BTreeMap<String, CategoryEntry>,
    /// fingerprint identity -> owning category
    index: HashMap<String, String>,
}

impl PatternStore {
    /// Create an empty store that will persist to `path`.
    pub fn new(path: impl Into<PathBuf>, source: &str) -> Self {
        Self {
            path: path.into(),
            version: "1.0.0".to_string(),
            source: source.to_string(),
            last_updated: Utc::now(),
            categories: BTreeMap::new(),
            index: HashMap::new(),
        }
    }

    /// Load a store from disk. An unreadable or malformed snapshot degrades
    /// to an empty in-memory store; it is never a fatal error.
    pub fn load(path: impl Into<PathBuf>, source: &str) -> Self {
        let path = path.into();
        let mut store = Self::new(path.clone(), source);

        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "no pattern store snapshot, starting empty");
                return store;
            }
        };

        match serde_json::from_str::<Snapshot>(&raw) {
            Ok(snapshot) => {
                store.version = snapshot.version;
                store.last_updated = snapshot.last_updated;
                store.categories = snapshot.categories;
                store.rebuild_index();
                info!(
                    path = %path.display(),
                    patterns = store.total_patterns(),
                    categories = store.categories.len(),
                    "pattern store loaded"
                );
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "malformed pattern store snapshot, starting empty");
            }
        }
        store
    }

    /// Rebuild the identity index from the category map, dropping any
    /// duplicate fingerprints that slipped into a hand-edited snapshot.
    fn rebuild_index(&mut self) {
        self.index.clear();
        let index = &mut self.index;
        for (name, entry) in &mut self.categories {
            entry.patterns.retain(|p| {
                let id = fingerprint_id(p);
                if index.contains_key(&id) {
                    warn!(category = %name, pattern = %p, "dropping duplicate fingerprint from snapshot");
                    false
                } else {
                    index.insert(id, name.clone());
                    true
                }
            });
        }
    }

    /// Insert one fingerprint. The category is created on first use.
    pub fn add(
        &mut self,
        category: &str,
        pattern: &str,
        severity: Severity,
        description: Option<&str>,
    ) -> AddOutcome {
        let id = fingerprint_id(pattern);
        if self.index.contains_key(&id) {
            return AddOutcome::Duplicate;
        }

        let entry = self
            .categories
            .entry(category.to_string())
            .or_insert_with(|| CategoryEntry {
                description: description
                    .map(String::from)
                    .unwrap_or_else(|| format!("Auto-created category: {category}")),
                severity,
                patterns: Vec::new(),
            });
        entry.patterns.push(pattern.to_string());
        self.index.insert(id, category.to_string());
        AddOutcome::Added
    }

    /// Insert many fingerprints, returning `(added, duplicated)` counts.
    pub fn add_batch(
        &mut self,
        entries: impl IntoIterator<Item = (String, String, Severity)>,
    ) -> (usize, usize) {
        let mut added = 0;
        let mut duplicated = 0;
        for (category, pattern, severity) in entries {
            match self.add(&category, &pattern, severity, None) {
                AddOutcome::Added => added += 1,
                AddOutcome::Duplicate => duplicated += 1,
            }
        }
        (added, duplicated)
    }

    /// Remove a fingerprint from a category. Returns false if it was not
    /// present there.
    pub fn remove(&mut self, category: &str, pattern: &str) -> bool {
        let id = fingerprint_id(pattern);
        let Some(entry) = self.categories.get_mut(category) else {
            return false;
        };
        let before = entry.patterns.len();
        entry.patterns.retain(|p| fingerprint_id(p) != id);
        let removed = entry.patterns.len() < before;
        if removed {
            self.index.remove(&id);
        }
        removed
    }

    /// Case-insensitive substring search across all categories.
    pub fn search(&self, needle: &str) -> Vec<(String, String)> {
        let needle = needle.to_lowercase();
        self.categories
            .iter()
            .flat_map(|(name, entry)| {
                entry
                    .patterns
                    .iter()
                    .filter(|p| p.to_lowercase().contains(&needle))
                    .map(|p| (name.clone(), p.clone()))
            })
            .collect()
    }

    /// Whether a fingerprint with this identity is already stored.
    pub fn contains(&self, pattern: &str) -> bool {
        self.index.contains_key(&fingerprint_id(pattern))
    }

    /// Every stored pattern with its category and category severity.
    pub fn all_patterns(&self) -> Vec<(String, String, Severity)> {
        self.categories
            .iter()
            .flat_map(|(name, entry)| {
                entry
                    .patterns
                    .iter()
                    .map(|p| (name.clone(), p.clone(), entry.severity))
            })
            .collect()
    }

    /// Names of all known categories.
    pub fn category_names(&self) -> Vec<String> {
        self.categories.keys().cloned().collect()
    }

    pub fn category(&self, name: &str) -> Option<&CategoryEntry> {
        self.categories.get(name)
    }

    pub fn total_patterns(&self) -> usize {
        self.categories.values().map(|e| e.patterns.len()).sum()
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }

    /// SHA-256 over the sorted list of all fingerprints. Ground truth for
    /// cross-node equality comparisons.
    pub fn snapshot_hash(&self) -> String {
        let mut patterns: Vec<&str> = self
            .categories
            .values()
            .flat_map(|e| e.patterns.iter().map(String::as_str))
            .collect();
        patterns.sort_unstable();
        let joined = patterns.join("\n");
        guardmesh_core::canonical::sha256_hex(joined.as_bytes())
    }

    /// Persist the store. Crash-safe: the snapshot is written to a sibling
    /// temp file, fsynced, then renamed over the canonical path. The
    /// previous snapshot is retained at `<path>.backup`. On success the
    /// patch component of the version is bumped and `lastUpdated` is set to
    /// the commit moment.
    pub fn save(&mut self) -> Result<()> {
        let next_version = bump_patch(&self.version);
        let now = Utc::now();

        let snapshot = Snapshot {
            version: next_version.clone(),
            total_patterns: self.total_patterns(),
            last_updated: now,
            source: self.source.clone(),
            categories: self.categories.clone(),
        };
        let body = serde_json::to_string_pretty(&snapshot)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(body.as_bytes())?;
            file.sync_all()?;
        }

        if self.path.exists() {
            let backup = backup_path(&self.path);
            if let Err(e) = fs::copy(&self.path, &backup) {
                warn!(error = %e, "failed to retain pattern store backup");
            }
        }

        fs::rename(&tmp, &self.path)
            .map_err(|e| GuardError::Store(format!("atomic rename failed: {e}")))?;

        self.version = next_version;
        self.last_updated = now;
        debug!(
            path = %self.path.display(),
            version = %self.version,
            patterns = self.total_patterns(),
            "pattern store saved"
        );
        Ok(())
    }
}

/// `foo/attack-patterns.json` -> `foo/attack-patterns.json.backup`
fn backup_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".backup");
    PathBuf::from(os)
}

/// Bump the patch component of a `major.minor.patch` version string.
/// Anything unparseable restarts at `1.0.1`.
fn bump_patch(version: &str) -> String {
    let parts: Vec<&str> = version.split('.').collect();
    if parts.len() == 3 {
        if let (Ok(major), Ok(minor), Ok(patch)) = (
            parts[0].parse::<u64>(),
            parts[1].parse::<u64>(),
            parts[2].parse::<u64>(),
        ) {
            return format!("{major}.{minor}.{}", patch + 1);
        }
    }
    "1.0.1".to_string()
}
