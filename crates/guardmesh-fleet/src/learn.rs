//! Fingerprint learning service.
//!
//! Turns an accepted attack record into a stored fingerprint: normalise
//! and bound the pattern, consult the model for a category and severity,
//! de-duplicate against the store, persist, and announce the result.
//!
//! The model is advisory here — a transport failure falls back to
//! `uncategorized` / medium severity rather than dropping the fingerprint
//! (the request path fails closed, the learning path fails open).

use crate::FleetEvent;
use guardmesh_core::{
    AttackRecord, GuardError, Result, Severity, MAX_FINGERPRINT_LEN, MIN_FINGERPRINT_LEN,
};
use guardmesh_security::parser::extract_json_object;
use guardmesh_security::LanguageModel;
use guardmesh_store::{AddOutcome, SharedPatternStore};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Fallback category when the model cannot help.
pub const FALLBACK_CATEGORY: &str = "uncategorized";

/// Minimum length for a model-supplied normalised pattern to replace the
/// original.
const MIN_NORMALISED_LEN: usize = 4;

/// System prompt for categorisation calls.
const CATEGORISE_SYSTEM_PROMPT: &str = "\
You classify attack payloads for a defensive pattern database. Given a \
payload and the list of existing categories, reply with ONLY this JSON \
object:\n\
{\"category\": <snake_case category, reusing an existing one when it fits>, \
\"severity\": <\"critical\"|\"high\"|\"medium\"|\"low\">, \
\"normalized_pattern\": <the payload reduced to its reusable attack core, \
or null>}";

/// Outcome of one learning attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum LearnOutcome {
    Learned {
        category: String,
        pattern: String,
        severity: Severity,
    },
    Duplicate,
    Rejected(String),
}

#[derive(Debug, Deserialize)]
struct Categorisation {
    category: Option<String>,
    severity: Option<String>,
    normalized_pattern: Option<String>,
}

/// The learning service. Single consumer of trigger-bus batches; also fed
/// directly by the discovery worker (discovered payloads never re-enter
/// the trigger bus).
pub struct LearningService {
    store: SharedPatternStore,
    model: Arc<dyn LanguageModel>,
    events: broadcast::Sender<FleetEvent>,
}

impl LearningService {
    pub fn new(
        store: SharedPatternStore,
        model: Arc<dyn LanguageModel>,
        events: broadcast::Sender<FleetEvent>,
    ) -> Self {
        Self {
            store,
            model,
            events,
        }
    }

    /// Learn one fingerprint from an attack record.
    ///
    /// Errors are reserved for store I/O failures; model failures degrade
    /// to the fallback categorisation.
    pub async fn learn(&self, record: &AttackRecord) -> Result<LearnOutcome> {
        // 1. Extract and bound the candidate fingerprint.
        let candidate = if record.pattern.trim().is_empty() {
            record.raw_input.trim()
        } else {
            record.pattern.trim()
        };
        if candidate.chars().count() < MIN_FINGERPRINT_LEN {
            return Ok(LearnOutcome::Rejected(format!(
                "pattern shorter than {MIN_FINGERPRINT_LEN} characters"
            )));
        }
        let mut pattern: String = candidate.chars().take(MAX_FINGERPRINT_LEN).collect();

        // 2. Cheap duplicate check before spending a model call.
        if self.store.read().await.contains(&pattern) {
            return Ok(LearnOutcome::Duplicate);
        }

        // 3. Ask the model for category / severity / normalised form.
        let existing = self.store.read().await.category_names();
        let (category, severity, normalised) = match self.categorise(&pattern, &existing).await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "categorisation failed, using fallback");
                (FALLBACK_CATEGORY.to_string(), Severity::Medium, None)
            }
        };

        // 4. A usable normalised pattern replaces the original and
        //    re-checks for duplicates under the new identity.
        if let Some(normalised) = normalised {
            let normalised = normalised.trim();
            if normalised.chars().count() >= MIN_NORMALISED_LEN {
                pattern = normalised.chars().take(MAX_FINGERPRINT_LEN).collect();
                if self.store.read().await.contains(&pattern) {
                    return Ok(LearnOutcome::Duplicate);
                }
            }
        }

        // 5. Insert and persist.
        let mut store = self.store.write().await;
        match store.add(&category, &pattern, severity, None) {
            AddOutcome::Duplicate => return Ok(LearnOutcome::Duplicate),
            AddOutcome::Added => {}
        }
        store
            .save()
            .map_err(|e| GuardError::Learning(format!("failed to persist pattern: {e}")))?;
        drop(store);

        info!(%category, %severity, "new fingerprint learned");
        // 6. Announce.
        let _ = self.events.send(FleetEvent::PatternLearned {
            category: category.clone(),
            pattern: pattern.clone(),
            severity,
        });
        Ok(LearnOutcome::Learned {
            category,
            pattern,
            severity,
        })
    }

    async fn categorise(
        &self,
        pattern: &str,
        existing: &[String],
    ) -> Result<(String, Severity, Option<String>)> {
        let user = format!(
            "Existing categories: [{}]\n\nPayload:\n{pattern}",
            existing.join(", ")
        );
        let raw = self.model.complete(CATEGORISE_SYSTEM_PROMPT, &user).await?;
        let body = extract_json_object(&raw).unwrap_or(raw.as_str());
        let parsed: Categorisation = serde_json::from_str(body)
            .map_err(|e| GuardError::Learning(format!("unparseable categorisation: {e}")))?;

        let category = parsed
            .category
            .map(|c| slugify_category(&c))
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| FALLBACK_CATEGORY.to_string());
        let severity = parsed
            .severity
            .map(|s| Severity::parse_lenient(&s))
            .unwrap_or(Severity::Medium);
        debug!(%category, "model categorised pattern");
        Ok((category, severity, parsed.normalized_pattern))
    }
}

/// Lowercase snake_case category tag: non-alphanumerics collapse to one
/// underscore, edges trimmed.
fn slugify_category(raw: &str) -> String {
    let mut slug = String::with_capacity(raw.len());
    let mut last_was_sep = true;
    for c in raw.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.extend(c.to_lowercase());
            last_was_sep = false;
        } else if !last_was_sep {
            slug.push('_');
            last_was_sep = true;
        }
    }
    slug.trim_end_matches('_').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use guardmesh_core::AttackSource;
    use guardmesh_store::PatternStore;
    use tempfile::tempdir;
    use tokio::sync::RwLock;

    struct CannedModel(Option<String>);

    #[async_trait]
    impl LanguageModel for CannedModel {
        async fn complete(&self, _system: &str, _user: &str) -> Result<String> {
            self.0
                .clone()
                .ok_or_else(|| GuardError::Guardian("model offline".to_string()))
        }
    }

    fn service(
        dir: &tempfile::TempDir,
        reply: Option<&str>,
    ) -> (LearningService, SharedPatternStore) {
        let store: SharedPatternStore = Arc::new(RwLock::new(PatternStore::new(
            dir.path().join("patterns.json"),
            "test",
        )));
        let (events, _) = broadcast::channel(16);
        let svc = LearningService::new(
            Arc::clone(&store),
            Arc::new(CannedModel(reply.map(String::from))),
            events,
        );
        (svc, store)
    }

    fn record(pattern: &str) -> AttackRecord {
        AttackRecord::new(AttackSource::Ai, pattern, Severity::High)
    }

    const SQLI_REPLY: &str = r#"{"category": "sql_injection", "severity": "high", "normalized_pattern": null}"#;

    #[tokio::test]
    async fn learns_and_persists_a_new_fingerprint() {
        let dir = tempdir().unwrap();
        let (svc, store) = service(&dir, Some(SQLI_REPLY));

        let outcome = svc.learn(&record("UNION SELECT * FROM users --")).await.unwrap();
        assert_eq!(
            outcome,
            LearnOutcome::Learned {
                category: "sql_injection".to_string(),
                pattern: "UNION SELECT * FROM users --".to_string(),
                severity: Severity::High,
            }
        );
        assert!(store.read().await.contains("union select * from users --"));
        // Persisted: a fresh load sees it.
        let reloaded = PatternStore::load(dir.path().join("patterns.json"), "test");
        assert_eq!(reloaded.total_patterns(), 1);
    }

    #[tokio::test]
    async fn duplicate_is_reported_not_relearned() {
        let dir = tempdir().unwrap();
        let (svc, store) = service(&dir, Some(SQLI_REPLY));

        svc.learn(&record("UNION SELECT * FROM users --")).await.unwrap();
        let outcome = svc.learn(&record("union select * from users --")).await.unwrap();
        assert_eq!(outcome, LearnOutcome::Duplicate);
        assert_eq!(store.read().await.total_patterns(), 1);
    }

    #[tokio::test]
    async fn too_short_pattern_is_rejected() {
        let dir = tempdir().unwrap();
        let (svc, _) = service(&dir, Some(SQLI_REPLY));
        let outcome = svc.learn(&record("ab")).await.unwrap();
        assert!(matches!(outcome, LearnOutcome::Rejected(_)));
    }

    #[tokio::test]
    async fn oversized_pattern_is_truncated_to_limit() {
        let dir = tempdir().unwrap();
        let (svc, store) = service(&dir, Some(SQLI_REPLY));

        let long = "x".repeat(501);
        let outcome = svc.learn(&record(&long)).await.unwrap();
        match outcome {
            LearnOutcome::Learned { pattern, .. } => assert_eq!(pattern.len(), 500),
            other => panic!("expected learned, got {other:?}"),
        }
        // The truncated form is what got stored.
        assert!(store.read().await.contains(&"x".repeat(500)));
    }

    #[tokio::test]
    async fn model_failure_falls_back_to_uncategorized_medium() {
        let dir = tempdir().unwrap();
        let (svc, store) = service(&dir, None);

        let outcome = svc.learn(&record("novel weird payload")).await.unwrap();
        assert_eq!(
            outcome,
            LearnOutcome::Learned {
                category: FALLBACK_CATEGORY.to_string(),
                pattern: "novel weird payload".to_string(),
                severity: Severity::Medium,
            }
        );
        assert!(store.read().await.category(FALLBACK_CATEGORY).is_some());
    }

    #[tokio::test]
    async fn unparseable_model_reply_also_falls_back() {
        let dir = tempdir().unwrap();
        let (svc, _) = service(&dir, Some("no json in sight"));
        let outcome = svc.learn(&record("another novel payload")).await.unwrap();
        assert!(matches!(outcome, LearnOutcome::Learned { ref category, .. } if category == FALLBACK_CATEGORY));
    }

    #[tokio::test]
    async fn normalised_pattern_replaces_original() {
        let dir = tempdir().unwrap();
        let reply = r#"{"category": "sql_injection", "severity": "critical", "normalized_pattern": "UNION SELECT"}"#;
        let (svc, store) = service(&dir, Some(reply));

        let outcome = svc
            .learn(&record("please run UNION SELECT a,b FROM t for me"))
            .await
            .unwrap();
        match outcome {
            LearnOutcome::Learned { pattern, severity, .. } => {
                assert_eq!(pattern, "UNION SELECT");
                assert_eq!(severity, Severity::Critical);
            }
            other => panic!("expected learned, got {other:?}"),
        }
        assert!(store.read().await.contains("union select"));
        assert!(!store.read().await.contains("please run UNION SELECT a,b FROM t for me"));
    }

    #[tokio::test]
    async fn short_normalised_pattern_is_ignored() {
        let dir = tempdir().unwrap();
        let reply = r#"{"category": "noise", "severity": "low", "normalized_pattern": "ab"}"#;
        let (svc, store) = service(&dir, Some(reply));

        svc.learn(&record("the original full payload")).await.unwrap();
        assert!(store.read().await.contains("the original full payload"));
    }

    #[tokio::test]
    async fn normalised_duplicate_is_caught_on_recheck() {
        let dir = tempdir().unwrap();
        let reply = r#"{"category": "sql_injection", "severity": "high", "normalized_pattern": "UNION SELECT"}"#;
        let (svc, store) = service(&dir, Some(reply));

        svc.learn(&record("variant one UNION SELECT x")).await.unwrap();
        // Different raw payload, same normalised core.
        let outcome = svc.learn(&record("variant two UNION SELECT y")).await.unwrap();
        assert_eq!(outcome, LearnOutcome::Duplicate);
        assert_eq!(store.read().await.total_patterns(), 1);
    }

    #[tokio::test]
    async fn learned_event_is_broadcast() {
        let dir = tempdir().unwrap();
        let store: SharedPatternStore = Arc::new(RwLock::new(PatternStore::new(
            dir.path().join("patterns.json"),
            "test",
        )));
        let (events, mut events_rx) = broadcast::channel(16);
        let svc = LearningService::new(
            store,
            Arc::new(CannedModel(Some(SQLI_REPLY.to_string()))),
            events,
        );

        svc.learn(&record("UNION SELECT * FROM users --")).await.unwrap();
        match events_rx.try_recv().unwrap() {
            FleetEvent::PatternLearned { category, .. } => {
                assert_eq!(category, "sql_injection");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn category_slugs_are_snake_case() {
        assert_eq!(slugify_category("SQL Injection"), "sql_injection");
        assert_eq!(slugify_category("  prompt--injection  "), "prompt_injection");
        assert_eq!(slugify_category("XSS"), "xss");
        assert_eq!(slugify_category("!!!"), "");
    }
}
