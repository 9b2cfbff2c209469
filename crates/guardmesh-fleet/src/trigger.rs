//! Attack trigger bus.
//!
//! Sits between the validation pipeline and the learning service. For
//! every attack record it decides whether the block is interesting enough
//! to learn from, buffers the keepers, and flushes them to the learner in
//! batches. Rules run in fixed order; the first match wins, so `priority`
//! always corresponds to the earliest matching rule.

use crate::FleetEvent;
use guardmesh_core::config::TriggerConfig;
use guardmesh_core::{AttackRecord, AttackSource, TriggerVerdict};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Trigger reasons, in rule order.
pub const REASON_AI_BLOCK: &str = "AI_BLOCK";
pub const REASON_HIGH_ANOMALY: &str = "HIGH_ANOMALY";
pub const REASON_UNKNOWN_PATTERN: &str = "UNKNOWN_PATTERN";
pub const REASON_REPEATED_ATTACK: &str = "REPEATED_ATTACK";
pub const REASON_KNOWN_PATTERN: &str = "KNOWN_PATTERN";
pub const REASON_NOT_INTERESTING: &str = "NOT_INTERESTING";

/// Metadata value marking a rule the filter could not attribute.
const UNKNOWN_RULE: &str = "UNKNOWN";

/// The trigger bus. Event delivery to subscribers happens synchronously on
/// the publishing task; subscribers must not block long.
pub struct TriggerBus {
    config: TriggerConfig,
    enabled: AtomicBool,
    buffer: Mutex<Vec<AttackRecord>>,
    /// Per-IP hit timestamps inside the sliding window.
    ip_hits: Mutex<HashMap<String, VecDeque<Instant>>>,
    events: broadcast::Sender<FleetEvent>,
    batches: mpsc::UnboundedSender<Vec<AttackRecord>>,
}

impl TriggerBus {
    pub fn new(
        config: TriggerConfig,
        events: broadcast::Sender<FleetEvent>,
        batches: mpsc::UnboundedSender<Vec<AttackRecord>>,
    ) -> Self {
        let enabled = config.enabled;
        Self {
            config,
            enabled: AtomicBool::new(enabled),
            buffer: Mutex::new(Vec::new()),
            ip_hits: Mutex::new(HashMap::new()),
            events,
            batches,
        }
    }

    /// Feed one record through the trigger rules. Saved records are
    /// buffered (when `auto_save` is on) and announced on the event
    /// channel. A disabled bus drops inputs silently.
    pub fn publish(&self, record: AttackRecord) -> TriggerVerdict {
        if !self.enabled.load(Ordering::SeqCst) {
            return TriggerVerdict::skip("DISABLED");
        }

        let verdict = self.evaluate(&record);
        debug!(
            source = %record.source,
            reason = %verdict.reason,
            priority = verdict.priority,
            save = verdict.should_save,
            "trigger verdict"
        );

        if verdict.should_save {
            let _ = self.events.send(FleetEvent::PatternDetected {
                record: record.clone(),
                verdict: verdict.clone(),
            });
            if self.config.auto_save {
                let should_flush = {
                    let mut buffer = self.buffer.lock().expect("trigger buffer poisoned");
                    buffer.push(record);
                    buffer.len() >= self.config.batch_size
                };
                if should_flush {
                    self.flush();
                }
            }
        }
        verdict
    }

    /// Apply the trigger rules in order. Also records the hit in the
    /// per-IP sliding window and prunes expired entries.
    pub fn evaluate(&self, record: &AttackRecord) -> TriggerVerdict {
        let repeats = self.record_ip_hit(record);

        // 1. An AI-flagged block is always novel enough to keep.
        if record.source == AttackSource::Ai {
            return TriggerVerdict::save(REASON_AI_BLOCK, 10);
        }
        // 2. Strong anomaly signal.
        if record
            .anomaly_score
            .is_some_and(|score| score >= self.config.anomaly_threshold)
        {
            return TriggerVerdict::save(REASON_HIGH_ANOMALY, 9);
        }
        // 3. Heuristic hits and unattributed rules.
        if record.source == AttackSource::Heuristic
            || record
                .metadata
                .get("matched_rule")
                .is_some_and(|rule| rule == UNKNOWN_RULE)
        {
            return TriggerVerdict::save(REASON_UNKNOWN_PATTERN, 8);
        }
        // 4. Hammering from one address.
        if repeats >= self.config.repeat_threshold {
            return TriggerVerdict::save(REASON_REPEATED_ATTACK, 7);
        }
        // 5. A plain regex hit is already in the rule table.
        if record.source == AttackSource::Regex {
            return TriggerVerdict::skip(REASON_KNOWN_PATTERN);
        }
        TriggerVerdict::skip(REASON_NOT_INTERESTING)
    }

    /// Record the hit for the record's IP and return how many hits that IP
    /// has inside the window (including this one). Entries older than the
    /// window are pruned on every record.
    fn record_ip_hit(&self, record: &AttackRecord) -> usize {
        let Some(ip) = record.metadata.get("ip") else {
            return 0;
        };
        let window = Duration::from_secs(self.config.repeat_window_secs);
        let now = Instant::now();

        let mut hits = self.ip_hits.lock().expect("ip window poisoned");
        hits.retain(|_, timestamps| {
            while timestamps
                .front()
                .is_some_and(|t| now.duration_since(*t) > window)
            {
                timestamps.pop_front();
            }
            !timestamps.is_empty()
        });

        let entry = hits.entry(ip.clone()).or_default();
        entry.push_back(now);
        entry.len()
    }

    /// Drain the buffer into one batch for the learning service.
    pub fn flush(&self) {
        let batch = {
            let mut buffer = self.buffer.lock().expect("trigger buffer poisoned");
            std::mem::take(&mut *buffer)
        };
        if batch.is_empty() {
            return;
        }
        info!(size = batch.len(), "flushing attack batch to learner");
        let _ = self.batches.send(batch);
    }

    /// Periodic flush driver. Runs until the bus is disabled via
    /// [`TriggerBus::stop`].
    pub fn spawn_flush_timer(self: Arc<Self>) -> JoinHandle<()> {
        let bus = self;
        let interval = Duration::from_millis(bus.config.flush_interval_ms.max(100));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !bus.enabled.load(Ordering::SeqCst) {
                    break;
                }
                bus.flush();
            }
        })
    }

    pub fn pending(&self) -> usize {
        self.buffer.lock().expect("trigger buffer poisoned").len()
    }

    /// Disable the bus. Further inputs are dropped silently; anything
    /// still buffered is flushed.
    pub fn stop(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        self.flush();
    }
}
