//! Shared application state and component wiring.

use guardmesh_core::config::GuardianConfig;
use guardmesh_core::{AttackRecord, Result};
use guardmesh_fleet::discovery::DiscoveryService;
use guardmesh_fleet::gossip::PeerNetwork;
use guardmesh_fleet::killswitch::{KillSwitch, SandboxDriver};
use guardmesh_fleet::learn::{LearnOutcome, LearningService};
use guardmesh_fleet::ledger::{BlockPattern, ReplicationLog};
use guardmesh_fleet::trigger::TriggerBus;
use guardmesh_fleet::FleetEvent;
use guardmesh_security::{
    GuardianValidator, HttpLanguageModel, LanguageModel, PatternMatcher, RegexFilter,
    ValidationPipeline,
};
use guardmesh_store::{OfflineQueue, PatternStore, SharedPatternStore};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// Monotonic counters surfaced by `GET /api/guardian/stats`.
#[derive(Debug, Default)]
pub struct GatewayStats {
    pub validations: AtomicU64,
    pub blocked: AtomicU64,
    pub allowed: AtomicU64,
    pub learned: AtomicU64,
    pub blocks_appended: AtomicU64,
}

impl GatewayStats {
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "validations": self.validations.load(Ordering::Relaxed),
            "blocked": self.blocked.load(Ordering::Relaxed),
            "allowed": self.allowed.load(Ordering::Relaxed),
            "learned": self.learned.load(Ordering::Relaxed),
            "blocksAppended": self.blocks_appended.load(Ordering::Relaxed),
        })
    }
}

/// A sandbox driver that only logs the requested actions. Stands in until
/// a real container runtime is wired up.
pub struct LogOnlyDriver;

#[async_trait::async_trait]
impl SandboxDriver for LogOnlyDriver {
    async fn probe(&self) -> Result<()> {
        Ok(())
    }

    async fn pause(&self, target: &str) -> Result<()> {
        warn!(%target, "sandbox pause requested (log-only driver)");
        Ok(())
    }

    async fn stop(&self, target: &str) -> Result<()> {
        warn!(%target, "sandbox stop requested (log-only driver)");
        Ok(())
    }
}

/// Everything a request handler needs.
pub struct AppState {
    pub node_id: String,
    pub config: GuardianConfig,
    pub pipeline: Arc<ValidationPipeline>,
    pub store: SharedPatternStore,
    pub ledger: Arc<Mutex<ReplicationLog>>,
    pub trigger: Arc<TriggerBus>,
    pub learner: Arc<LearningService>,
    pub discovery: Arc<DiscoveryService>,
    pub gossip: Option<Arc<PeerNetwork>>,
    pub stats: Arc<GatewayStats>,
    pub events: broadcast::Sender<FleetEvent>,
    background: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl AppState {
    /// Build the whole node from configuration, talking to the real
    /// guardian model endpoint. Spawns the background loops (trigger
    /// flush, learn-and-replicate, kill-switch, gossip listener) but not
    /// the HTTP server.
    pub async fn build(config: GuardianConfig) -> anyhow::Result<Arc<Self>> {
        let model: Arc<dyn LanguageModel> =
            Arc::new(HttpLanguageModel::new(config.guardian_ai.clone())?);
        Self::build_with_model(config, model).await
    }

    /// Build a node around an injected [`LanguageModel`]. This is the seam
    /// the end-to-end tests use to script the guardian's replies.
    pub async fn build_with_model(
        config: GuardianConfig,
        model: Arc<dyn LanguageModel>,
    ) -> anyhow::Result<Arc<Self>> {
        let node_id = Uuid::new_v4().to_string();
        let data_dir = std::path::PathBuf::from(&config.data_dir);

        let store: SharedPatternStore = Arc::new(RwLock::new(PatternStore::load(
            data_dir.join("attack-patterns.json"),
            &node_id,
        )));
        let queue = Arc::new(Mutex::new(OfflineQueue::load(
            data_dir.join("offline-queue.json"),
        )));
        let ledger = Arc::new(Mutex::new(ReplicationLog::new(&node_id)));
        let (events, _) = broadcast::channel::<FleetEvent>(256);
        let stats = Arc::new(GatewayStats::default());

        // Pipeline -> trigger bus channel.
        let (attack_tx, attack_rx) = mpsc::unbounded_channel::<AttackRecord>();
        // Trigger bus -> learner batches.
        let (batch_tx, batch_rx) = mpsc::unbounded_channel::<Vec<AttackRecord>>();

        let pipeline = Arc::new(ValidationPipeline::new(
            config.stages.clone(),
            RegexFilter::new()?,
            PatternMatcher::new(Arc::clone(&store)),
            GuardianValidator::new(Arc::clone(&model)),
            Some(attack_tx),
        ));
        pipeline.set_enabled(config.enabled);

        let trigger = Arc::new(TriggerBus::new(
            config.attack_trigger.clone(),
            events.clone(),
            batch_tx,
        ));
        let learner = Arc::new(LearningService::new(
            Arc::clone(&store),
            Arc::clone(&model),
            events.clone(),
        ));
        let discovery = Arc::new(DiscoveryService::new(
            config.auto_discovery.clone(),
            Arc::clone(&store),
            Arc::clone(&learner),
            Arc::clone(&model),
        ));

        let gossip = if config.ledger.enabled {
            Some(PeerNetwork::new(
                &node_id,
                config.ledger.network.clone(),
                Arc::clone(&ledger),
                Arc::clone(&store),
                Some(Arc::clone(&queue)),
                events.clone(),
            ))
        } else {
            None
        };

        let state = Arc::new(Self {
            node_id,
            config,
            pipeline,
            store,
            ledger,
            trigger,
            learner,
            discovery,
            gossip,
            stats,
            events,
            background: std::sync::Mutex::new(Vec::new()),
        });

        Self::spawn_background(&state, attack_rx, batch_rx).await?;
        Ok(state)
    }

    async fn spawn_background(
        state: &Arc<Self>,
        mut attack_rx: mpsc::UnboundedReceiver<AttackRecord>,
        mut batch_rx: mpsc::UnboundedReceiver<Vec<AttackRecord>>,
    ) -> anyhow::Result<()> {
        let mut tasks = Vec::new();

        // Pipeline blocks feed the trigger bus on its own task so event
        // dispatch stays off the request path.
        let trigger = Arc::clone(&state.trigger);
        tasks.push(tokio::spawn(async move {
            while let Some(record) = attack_rx.recv().await {
                trigger.publish(record);
            }
        }));
        tasks.push(Arc::clone(&state.trigger).spawn_flush_timer());

        // Learn each flushed batch, then commit the accepted fingerprints
        // as one block and gossip it.
        let learn_state = Arc::clone(state);
        tasks.push(tokio::spawn(async move {
            while let Some(batch) = batch_rx.recv().await {
                learn_state.learn_and_replicate(batch).await;
            }
        }));

        // Kill-switch watches the trigger stream.
        if state.config.kill_switch.enabled {
            let switch = Arc::new(KillSwitch::new(
                state.config.kill_switch.clone(),
                Arc::new(LogOnlyDriver),
            ));
            tasks.push(switch.spawn(state.events.subscribe()));
        }

        // Gossip listener and bootstrap dials, plus periodic replay of
        // gossip that was queued while no peer was reachable.
        if let Some(gossip) = &state.gossip {
            Arc::clone(gossip)
                .start()
                .await
                .map_err(|e| anyhow::anyhow!("gossip start failed: {e}"))?;

            let replayer = Arc::clone(gossip);
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(std::time::Duration::from_secs(30));
                loop {
                    ticker.tick().await;
                    if let Err(e) = replayer.replay_offline().await {
                        warn!(error = %e, "offline gossip replay failed");
                    }
                }
            }));
        }

        // Discovery on startup, when configured.
        if state.config.auto_discovery.enabled && state.config.auto_discovery.run_on_startup {
            let discovery = Arc::clone(&state.discovery);
            tasks.push(tokio::spawn(async move {
                if let Err(e) = discovery.start().await {
                    warn!(error = %e, "startup discovery run failed");
                }
            }));
        }

        // Stats tracking from fleet events.
        let stats = Arc::clone(&state.stats);
        let mut events_rx = state.events.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                match events_rx.recv().await {
                    Ok(FleetEvent::PatternLearned { .. }) => {
                        stats.learned.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(FleetEvent::BlockAdded(_)) => {
                        stats.blocks_appended.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        state.background.lock().expect("background list poisoned").extend(tasks);
        Ok(())
    }

    /// Learn every record in a batch; commit whatever was accepted as a
    /// new block, append it locally, and announce it to the fleet.
    pub async fn learn_and_replicate(&self, batch: Vec<AttackRecord>) {
        let mut learned = Vec::new();
        for record in &batch {
            match self.learner.learn(record).await {
                Ok(LearnOutcome::Learned {
                    category,
                    pattern,
                    severity,
                }) => {
                    learned.push(BlockPattern {
                        pattern,
                        category,
                        severity,
                        ts: chrono_now_millis(),
                    });
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "learning failed for record"),
            }
        }
        if learned.is_empty() {
            return;
        }

        let block = {
            let mut ledger = self.ledger.lock().await;
            let prev_hash = ledger.latest().hash.clone();
            let block = ledger.create_block(learned, &prev_hash);
            if !ledger.add_block(block.clone()) {
                warn!(index = block.index, "locally created block failed to append");
                return;
            }
            block
        };
        info!(index = block.index, patterns = block.patterns.len(), "committed learned block");
        let _ = self.events.send(FleetEvent::BlockAdded(block.clone()));

        // A block is re-broadcast only after local acceptance.
        if let Some(gossip) = &self.gossip {
            gossip.broadcast_block(&block).await;
        }
    }

    /// Abort all background tasks and flush what can be flushed.
    pub fn shutdown(&self) {
        self.trigger.stop();
        if let Some(gossip) = &self.gossip {
            gossip.stop();
        }
        for task in self.background.lock().expect("background list poisoned").drain(..) {
            task.abort();
        }
    }
}

fn chrono_now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
