//! Configuration surface for the Guardmesh gateway.
//!
//! Every field carries a serde default so a partial YAML file (or none at
//! all) resolves to a working configuration.

use serde::{Deserialize, Serialize};

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardianConfig {
    /// Global on/off toggle for the validation pipeline.
    pub enabled: bool,
    /// Address for the HTTP API.
    pub listen_addr: String,
    /// Directory for persisted state (pattern store, offline queue).
    pub data_dir: String,
    /// Tool names subject to validation on the before-tool-call hook.
    pub blocked_tools: Vec<String>,
    pub stages: StagesConfig,
    pub guardian_ai: GuardianAiConfig,
    pub attack_trigger: TriggerConfig,
    pub auto_discovery: DiscoveryConfig,
    pub kill_switch: KillSwitchConfig,
    pub ledger: LedgerConfig,
    pub logging: LoggingConfig,
}

impl Default for GuardianConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "127.0.0.1:7717".to_string(),
            data_dir: "data".to_string(),
            blocked_tools: vec![
                "bash".to_string(),
                "exec".to_string(),
                "shell".to_string(),
                "write_file".to_string(),
                "send_email".to_string(),
                "browser".to_string(),
            ],
            stages: StagesConfig::default(),
            guardian_ai: GuardianAiConfig::default(),
            attack_trigger: TriggerConfig::default(),
            auto_discovery: DiscoveryConfig::default(),
            kill_switch: KillSwitchConfig::default(),
            ledger: LedgerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Per-stage enable flags for the validation pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StagesConfig {
    pub regex: bool,
    pub pattern_db: bool,
    pub guardian_ai: bool,
    pub json_parser: bool,
}

impl Default for StagesConfig {
    fn default() -> Self {
        Self {
            regex: true,
            pattern_db: true,
            guardian_ai: true,
            json_parser: true,
        }
    }
}

/// Settings for the guardian LLM adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardianAiConfig {
    /// Base URL of an OpenAI-compatible chat-completions endpoint.
    pub base_url: String,
    pub model: String,
    pub api_key: String,
    pub max_tokens: u32,
    pub timeout_ms: u64,
    /// Provider label, recorded in telemetry only.
    pub provider: String,
}

impl Default for GuardianAiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".to_string(),
            model: "llama3.1".to_string(),
            api_key: String::new(),
            max_tokens: 256,
            timeout_ms: 10_000,
            provider: "openai-compatible".to_string(),
        }
    }
}

/// Policy for the attack trigger bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    pub enabled: bool,
    /// Records with an anomaly score at or above this are always saved.
    pub anomaly_threshold: f64,
    /// Number of records from one IP inside the window that counts as a
    /// repeated attack.
    pub repeat_threshold: usize,
    pub repeat_window_secs: u64,
    /// Buffer flushes to the learning service at this size.
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    /// When false, verdicts are computed but nothing is buffered.
    pub auto_save: bool,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            anomaly_threshold: 0.8,
            repeat_threshold: 3,
            repeat_window_secs: 60,
            batch_size: 10,
            flush_interval_ms: 30_000,
            auto_save: true,
        }
    }
}

/// Settings for the background discovery worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    /// Stop after this many accepted patterns.
    pub target_count: usize,
    /// Overall budget for one run.
    pub timeout_minutes: u64,
    pub run_on_startup: bool,
    /// Delay between iterations, throttling the model.
    pub pause_between_ms: u64,
    /// Optional model override for discovery prompts.
    pub model: Option<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            target_count: 10,
            timeout_minutes: 10,
            run_on_startup: false,
            pause_between_ms: 2_000,
            model: None,
        }
    }
}

/// What the kill-switch does when a critical detection arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxAction {
    Pause,
    Stop,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KillSwitchConfig {
    pub enabled: bool,
    pub auto_action: SandboxAction,
    /// Prefix used when synthesising a sandbox name from a session key.
    pub container_prefix: String,
}

impl Default for KillSwitchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            auto_action: SandboxAction::None,
            container_prefix: "moltbot-sandbox-".to_string(),
        }
    }
}

/// Replication layer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub enabled: bool,
    pub network: NetworkConfig,
    pub consensus: ConsensusConfig,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            network: NetworkConfig::default(),
            consensus: ConsensusConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Peers to dial at startup, as `host:port`.
    pub bootstrap_nodes: Vec<String>,
    pub listen_port: u16,
    pub max_peers: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bootstrap_nodes: Vec::new(),
            listen_port: 7718,
            max_peers: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub min_validators: usize,
    pub approval_threshold: f64,
    pub block_interval_secs: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            min_validators: 1,
            approval_threshold: 0.5,
            block_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter (trace, debug, info, warn, error).
    pub level: String,
    /// Output format: `text` or `json`.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}
