//! Sandbox kill-switch.
//!
//! Watches the trigger bus for critical detections and quiesces the
//! offending sandbox through an abstract [`SandboxDriver`]. The container
//! runtime itself is an external collaborator; this module only decides
//! *whether* and *what* to pause or stop.

use crate::FleetEvent;
use async_trait::async_trait;
use guardmesh_core::config::{KillSwitchConfig, SandboxAction};
use guardmesh_core::{AttackRecord, Result, Severity, TriggerVerdict};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Minimum trigger priority that can fire the kill-switch.
const MIN_PRIORITY: u8 = 9;

/// Abstract driver for the sandbox runtime.
#[async_trait]
pub trait SandboxDriver: Send + Sync {
    /// Availability probe, called once at startup.
    async fn probe(&self) -> Result<()>;
    async fn pause(&self, target: &str) -> Result<()>;
    async fn stop(&self, target: &str) -> Result<()>;
}

/// The kill-switch.
pub struct KillSwitch {
    config: KillSwitchConfig,
    driver: Arc<dyn SandboxDriver>,
    /// Set by the startup probe; when false, events are silently skipped.
    available: AtomicBool,
}

impl KillSwitch {
    pub fn new(config: KillSwitchConfig, driver: Arc<dyn SandboxDriver>) -> Self {
        Self {
            config,
            driver,
            available: AtomicBool::new(false),
        }
    }

    /// Probe the driver once, then consume trigger events until the
    /// channel closes.
    pub fn spawn(self: Arc<Self>, mut events: broadcast::Receiver<FleetEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            match self.driver.probe().await {
                Ok(()) => {
                    self.available.store(true, Ordering::SeqCst);
                    info!("sandbox driver available, kill-switch armed");
                }
                Err(e) => {
                    warn!(error = %e, "sandbox driver probe failed, kill-switch disarmed");
                }
            }
            loop {
                match events.recv().await {
                    Ok(FleetEvent::PatternDetected { record, verdict }) => {
                        self.handle(&record, &verdict).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "kill-switch lagged behind trigger events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Apply the gating rules and fire the configured action.
    pub async fn handle(&self, record: &AttackRecord, verdict: &TriggerVerdict) {
        if !self.config.enabled || self.config.auto_action == SandboxAction::None {
            return;
        }
        if !self.available.load(Ordering::SeqCst) {
            return;
        }
        if !matches!(record.severity, Severity::Critical | Severity::High) {
            return;
        }
        if verdict.priority < MIN_PRIORITY {
            return;
        }
        let Some(target) = resolve_target(&record.metadata, &self.config.container_prefix) else {
            debug!("no sandbox target resolvable from record metadata");
            return;
        };

        info!(
            %target,
            action = ?self.config.auto_action,
            severity = %record.severity,
            priority = verdict.priority,
            "kill-switch firing"
        );
        let outcome = match self.config.auto_action {
            SandboxAction::Pause => self.driver.pause(&target).await,
            SandboxAction::Stop => self.driver.stop(&target).await,
            SandboxAction::None => return,
        };
        // Driver failures are logged, never retried, and never cascade
        // into the request path.
        if let Err(e) = outcome {
            error!(%target, error = %e, "sandbox action failed");
        }
    }
}

/// Resolve the sandbox to quiesce: an explicit container name wins, else
/// one is synthesised from the session key.
pub fn resolve_target(metadata: &HashMap<String, String>, prefix: &str) -> Option<String> {
    if let Some(name) = metadata.get("containerName") {
        return Some(name.clone());
    }
    metadata
        .get("sessionKey")
        .map(|key| format!("{prefix}{}", slug(key)))
}

/// Lowercase a session key and replace every non-alphanumeric character
/// with `-`.
fn slug(raw: &str) -> String {
    raw.to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}
