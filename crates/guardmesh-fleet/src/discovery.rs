//! Background red-team discovery loop.
//!
//! Repeatedly asks the model for a novel attack payload in a randomly
//! chosen category and feeds it straight into the learning service. This
//! is a distinct entry point into learning: discovered records never pass
//! through the trigger bus, so they cannot re-trigger themselves as
//! AI blocks.

use crate::learn::{LearnOutcome, LearningService};
use guardmesh_core::config::DiscoveryConfig;
use guardmesh_core::{AttackRecord, AttackSource, GuardError, Result, Severity};
use guardmesh_security::LanguageModel;
use guardmesh_store::SharedPatternStore;
use rand::seq::SliceRandom;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Categories used to seed generation when the store is empty.
const SEED_CATEGORIES: &[&str] = &[
    "prompt_injection",
    "command_injection",
    "sql_injection",
    "path_traversal",
    "data_exfiltration",
];

/// How many existing patterns the generation prompt lists as exclusions.
const MAX_EXCLUSIONS: usize = 10;

const DISCOVERY_SYSTEM_PROMPT: &str = "\
You help maintain a defensive attack-pattern database by proposing \
payloads the database does not yet recognise. Given a category and a list \
of already-known payloads, reply with ONLY one novel payload string for \
that category — no explanation, no quoting, no markdown.";

/// Summary of one discovery run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryResult {
    pub discovered: usize,
    pub duplicates: usize,
    pub errors: usize,
    pub elapsed_secs: u64,
    pub timed_out: bool,
}

/// The discovery worker. At most one run at a time.
pub struct DiscoveryService {
    config: DiscoveryConfig,
    store: SharedPatternStore,
    learner: Arc<LearningService>,
    model: Arc<dyn LanguageModel>,
    running: AtomicBool,
    cancelled: AtomicBool,
}

impl DiscoveryService {
    pub fn new(
        config: DiscoveryConfig,
        store: SharedPatternStore,
        learner: Arc<LearningService>,
        model: Arc<dyn LanguageModel>,
    ) -> Self {
        Self {
            config,
            store,
            learner,
            model,
            running: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Request cancellation. Observed at the head of the work loop.
    pub fn stop(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Run the discovery loop until `target_count` patterns are accepted
    /// or the time budget elapses. Refuses concurrent starts.
    pub async fn start(&self) -> Result<DiscoveryResult> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(GuardError::Discovery(
                "discovery already running".to_string(),
            ));
        }
        self.cancelled.store(false, Ordering::SeqCst);
        let started = Instant::now();
        let budget = Duration::from_secs(self.config.timeout_minutes * 60);
        info!(
            target = self.config.target_count,
            timeout_minutes = self.config.timeout_minutes,
            "discovery run starting"
        );

        let mut result = DiscoveryResult::default();
        // The work loop races the overall deadline.
        let outcome = tokio::time::timeout(budget, self.run_loop(&mut result)).await;
        result.timed_out = outcome.is_err();
        result.elapsed_secs = started.elapsed().as_secs();

        self.running.store(false, Ordering::SeqCst);
        info!(
            discovered = result.discovered,
            duplicates = result.duplicates,
            errors = result.errors,
            timed_out = result.timed_out,
            "discovery run finished"
        );
        Ok(result)
    }

    async fn run_loop(&self, result: &mut DiscoveryResult) {
        let pause = Duration::from_millis(self.config.pause_between_ms);
        while result.discovered < self.config.target_count {
            if self.cancelled.load(Ordering::SeqCst) {
                debug!("discovery cancelled");
                break;
            }

            match self.discover_one().await {
                Ok(LearnOutcome::Learned { category, .. }) => {
                    result.discovered += 1;
                    info!(
                        %category,
                        progress = format!("{}/{}", result.discovered, self.config.target_count),
                        "discovered novel pattern"
                    );
                }
                Ok(LearnOutcome::Duplicate) => result.duplicates += 1,
                Ok(LearnOutcome::Rejected(reason)) => {
                    debug!(%reason, "discovery candidate rejected");
                    result.errors += 1;
                }
                Err(e) => {
                    warn!(error = %e, "discovery iteration failed");
                    result.errors += 1;
                }
            }

            tokio::time::sleep(pause).await;
        }
    }

    /// One iteration: pick a category, generate a payload, learn it.
    async fn discover_one(&self) -> Result<LearnOutcome> {
        let (category, exclusions) = self.pick_target().await;

        let user = format!(
            "Category: {category}\nKnown payloads (do not repeat these):\n{}",
            exclusions
                .iter()
                .map(|p| format!("- {p}"))
                .collect::<Vec<_>>()
                .join("\n")
        );
        let raw = self.model.complete(DISCOVERY_SYSTEM_PROMPT, &user).await?;
        let payload = raw.lines().next().unwrap_or("").trim().trim_matches('"');
        if payload.is_empty() {
            return Err(GuardError::Discovery("model returned no payload".to_string()));
        }

        let record = AttackRecord::new(AttackSource::Ai, payload, Severity::High)
            .with_metadata("origin", "discovery")
            .with_metadata("requested_category", &category);
        self.learner.learn(&record).await
    }

    /// Choose a category uniformly from the store (seed set when empty)
    /// and gather up to [`MAX_EXCLUSIONS`] of its patterns.
    async fn pick_target(&self) -> (String, Vec<String>) {
        let store = self.store.read().await;
        let mut categories = store.category_names();
        if categories.is_empty() {
            categories = SEED_CATEGORIES.iter().map(|s| s.to_string()).collect();
        }
        let category = categories
            .choose(&mut rand::thread_rng())
            .cloned()
            .unwrap_or_else(|| SEED_CATEGORIES[0].to_string());

        let exclusions = store
            .category(&category)
            .map(|entry| {
                entry
                    .patterns
                    .iter()
                    .take(MAX_EXCLUSIONS)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        (category, exclusions)
    }
}
