//! Core types, traits, and errors for Guardmesh
//!
//! This crate contains the foundational data structures shared across all
//! Guardmesh components: attack records, trigger verdicts, validation
//! verdicts, severity levels, fingerprint identity, and the configuration
//! surface. It has no async machinery of its own.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use uuid::Uuid;

pub mod canonical;
pub mod config;

/// Maximum stored length of a fingerprint, in characters. Longer payloads
/// are truncated before learning.
pub const MAX_FINGERPRINT_LEN: usize = 500;

/// Minimum length of a fingerprint candidate. Shorter strings are rejected
/// by the learning service.
pub const MIN_FINGERPRINT_LEN: usize = 3;

// ---------------------------------------------------------------------------
// Severity
// ---------------------------------------------------------------------------

/// Severity level for an attack category or detection.
///
/// Ordering is ascending: `Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Numeric weight on a 0–10 scale. The pattern matcher blocks when a
    /// match's weight is at least 8 ("severity high or critical").
    #[must_use]
    pub fn weight(&self) -> u8 {
        match self {
            Severity::Critical => 10,
            Severity::High => 8,
            Severity::Medium => 5,
            Severity::Low => 2,
        }
    }

    /// Lowercase string form, matching the persisted snapshot format.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
        }
    }

    /// Parse a severity from its lowercase string form. Unknown values map
    /// to `Medium` so that a sloppy model reply never escalates severity.
    #[must_use]
    pub fn parse_lenient(s: &str) -> Severity {
        match s.trim().to_lowercase().as_str() {
            "critical" => Severity::Critical,
            "high" => Severity::High,
            "low" => Severity::Low,
            _ => Severity::Medium,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Fingerprint identity
// ---------------------------------------------------------------------------

/// Compute the identity of a fingerprint: the first 16 hex digits of the
/// SHA-256 of its lowercased, trimmed form.
///
/// Two fingerprints with the same identity are duplicates, store-wide.
#[must_use]
pub fn fingerprint_id(pattern: &str) -> String {
    let canon = pattern.trim().to_lowercase();
    let digest = Sha256::digest(canon.as_bytes());
    hex::encode(digest)[..16].to_string()
}

// ---------------------------------------------------------------------------
// Attack records
// ---------------------------------------------------------------------------

/// Which detection stage produced an attack record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttackSource {
    /// Matched a hard-coded regex rule.
    Regex,
    /// Flagged by the guardian model or its response parser.
    Ai,
    /// Flagged by fuzzy similarity against the pattern store.
    Heuristic,
    /// Flagged by request-rate policy.
    RateLimit,
    /// Origin unknown (external producer).
    Unknown,
}

impl std::fmt::Display for AttackSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AttackSource::Regex => "regex",
            AttackSource::Ai => "ai",
            AttackSource::Heuristic => "heuristic",
            AttackSource::RateLimit => "rate-limit",
            AttackSource::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A detected attack, handed from the validation pipeline to the trigger
/// bus and onwards to the learning service. Transient: records are not
/// persisted, only the fingerprints distilled from them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttackRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub source: AttackSource,
    /// The full text that was validated.
    pub raw_input: String,
    /// The extracted attack pattern (falls back to `raw_input` when the
    /// detecting stage could not isolate a narrower payload).
    pub pattern: String,
    pub severity: Severity,
    /// Optional anomaly score in `[0, 1]` from heuristic detectors.
    pub anomaly_score: Option<f64>,
    /// Free-form metadata: ip, session key, agent id, tool name,
    /// container name, matched rule, …
    pub metadata: HashMap<String, String>,
}

impl AttackRecord {
    /// Create a record with a fresh id and the current timestamp.
    pub fn new(source: AttackSource, raw_input: &str, severity: Severity) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source,
            raw_input: raw_input.to_string(),
            pattern: raw_input.to_string(),
            severity,
            anomaly_score: None,
            metadata: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_pattern(mut self, pattern: &str) -> Self {
        self.pattern = pattern.to_string();
        self
    }

    #[must_use]
    pub fn with_anomaly_score(mut self, score: f64) -> Self {
        self.anomaly_score = Some(score.clamp(0.0, 1.0));
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }
}

/// Decision of the trigger bus for one attack record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerVerdict {
    /// Whether the record is worth learning from.
    pub should_save: bool,
    /// Rule that produced the decision (e.g. `AI_BLOCK`, `KNOWN_PATTERN`).
    pub reason: String,
    /// Priority 0–10; 10 is most urgent.
    pub priority: u8,
}

impl TriggerVerdict {
    pub fn save(reason: &str, priority: u8) -> Self {
        Self {
            should_save: true,
            reason: reason.to_string(),
            priority,
        }
    }

    pub fn skip(reason: &str) -> Self {
        Self {
            should_save: false,
            reason: reason.to_string(),
            priority: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Validation verdicts
// ---------------------------------------------------------------------------

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Regex,
    Pattern,
    Guardian,
    Parser,
}

impl Stage {
    /// 1-based position in the pipeline, used for `stage_reached`.
    #[must_use]
    pub fn number(&self) -> u8 {
        match self {
            Stage::Regex => 1,
            Stage::Pattern => 2,
            Stage::Guardian => 3,
            Stage::Parser => 4,
        }
    }
}

/// Telemetry for a single executed stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOutcome {
    pub stage: Stage,
    pub passed: bool,
    /// Human-readable detail for blocks (rule name, similarity, parse tag).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub elapsed_ms: u64,
}

/// The outcome of one pipeline execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub allowed: bool,
    /// `<STAGE_TAG>: <detail>` when blocked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_reason: Option<String>,
    /// 0 when the pipeline was bypassed (disabled or empty input);
    /// otherwise the number of the last stage that executed.
    pub stage_reached: u8,
    pub stages: Vec<StageOutcome>,
    pub duration_ms: u64,
}

impl Verdict {
    /// An allow verdict that bypassed every stage.
    pub fn bypass() -> Self {
        Self {
            allowed: true,
            block_reason: None,
            stage_reached: 0,
            stages: Vec::new(),
            duration_ms: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Unified error type for Guardmesh library crates.
#[derive(thiserror::Error, Debug)]
pub enum GuardError {
    #[error("store error: {0}")]
    Store(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("rule error: {0}")]
    Rule(String),

    #[error("guardian error: {0}")]
    Guardian(String),

    #[error("learning error: {0}")]
    Learning(String),

    #[error("discovery error: {0}")]
    Discovery(String),

    #[error("gossip error: {0}")]
    Gossip(String),

    #[error("sandbox driver error: {0}")]
    Sandbox(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("queue is already being processed")]
    QueueBusy,
}

pub type Result<T> = std::result::Result<T, GuardError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }

    #[test]
    fn severity_weights() {
        assert_eq!(Severity::Critical.weight(), 10);
        assert_eq!(Severity::High.weight(), 8);
        assert_eq!(Severity::Medium.weight(), 5);
        assert_eq!(Severity::Low.weight(), 2);
    }

    #[test]
    fn severity_lenient_parse_defaults_to_medium() {
        assert_eq!(Severity::parse_lenient("CRITICAL"), Severity::Critical);
        assert_eq!(Severity::parse_lenient(" high "), Severity::High);
        assert_eq!(Severity::parse_lenient("bogus"), Severity::Medium);
        assert_eq!(Severity::parse_lenient(""), Severity::Medium);
    }

    #[test]
    fn fingerprint_identity_normalises_case_and_whitespace() {
        let a = fingerprint_id("Rm -Rf /");
        let b = fingerprint_id("  rm -rf /  ");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn fingerprint_identity_differs_for_distinct_payloads() {
        assert_ne!(fingerprint_id("union select"), fingerprint_id("drop table"));
    }

    #[test]
    fn attack_record_builder() {
        let record = AttackRecord::new(AttackSource::Regex, "rm -rf /", Severity::Critical)
            .with_pattern("rm -rf")
            .with_anomaly_score(1.5)
            .with_metadata("ip", "10.0.0.1");

        assert_eq!(record.pattern, "rm -rf");
        assert_eq!(record.anomaly_score, Some(1.0));
        assert_eq!(record.metadata.get("ip").unwrap(), "10.0.0.1");
    }

    #[test]
    fn attack_source_serde_is_kebab_case() {
        let json = serde_json::to_string(&AttackSource::RateLimit).unwrap();
        assert_eq!(json, "\"rate-limit\"");
        let back: AttackSource = serde_json::from_str("\"heuristic\"").unwrap();
        assert_eq!(back, AttackSource::Heuristic);
    }

    #[test]
    fn verdict_serde_roundtrip_preserves_outcome() {
        let verdict = Verdict {
            allowed: false,
            block_reason: Some("REGEX_MATCH: rm_rf".to_string()),
            stage_reached: 1,
            stages: vec![StageOutcome {
                stage: Stage::Regex,
                passed: false,
                detail: Some("rm_rf".to_string()),
                elapsed_ms: 0,
            }],
            duration_ms: 3,
        };

        let json = serde_json::to_string(&verdict).unwrap();
        let back: Verdict = serde_json::from_str(&json).unwrap();
        assert_eq!(back.allowed, verdict.allowed);
        assert_eq!(back.stage_reached, verdict.stage_reached);
        assert_eq!(back.block_reason, verdict.block_reason);
    }

    #[test]
    fn stage_numbers_are_pipeline_order() {
        assert_eq!(Stage::Regex.number(), 1);
        assert_eq!(Stage::Pattern.number(), 2);
        assert_eq!(Stage::Guardian.number(), 3);
        assert_eq!(Stage::Parser.number(), 4);
    }
}
