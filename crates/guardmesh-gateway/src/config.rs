//! YAML configuration loading and validation for the gateway.

use guardmesh_core::config::{GuardianConfig, SandboxAction};
use std::path::Path;

/// Load a [`GuardianConfig`] from a YAML file at `path`.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the YAML is invalid.
pub fn load_config(path: &Path) -> anyhow::Result<GuardianConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;
    let config: GuardianConfig = serde_yaml::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config YAML: {e}"))?;
    Ok(config)
}

/// Reject configurations that cannot work.
pub fn validate_config(config: &GuardianConfig) -> anyhow::Result<()> {
    if config.listen_addr.parse::<std::net::SocketAddr>().is_err() {
        anyhow::bail!("listen_addr '{}' is not a socket address", config.listen_addr);
    }
    if !(0.0..=1.0).contains(&config.attack_trigger.anomaly_threshold) {
        anyhow::bail!(
            "attack_trigger.anomaly_threshold must be within [0, 1], got {}",
            config.attack_trigger.anomaly_threshold
        );
    }
    if config.attack_trigger.batch_size == 0 {
        anyhow::bail!("attack_trigger.batch_size must be at least 1");
    }
    if config.kill_switch.enabled
        && config.kill_switch.auto_action != SandboxAction::None
        && config.kill_switch.container_prefix.is_empty()
    {
        anyhow::bail!("kill_switch.container_prefix must not be empty when armed");
    }
    if config.stages.json_parser && !config.stages.guardian_ai {
        anyhow::bail!("stages.json_parser requires stages.guardian_ai");
    }
    Ok(())
}
