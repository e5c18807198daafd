//! Engine configuration and the tenant/quota providers it exposes.
//!
//! The configuration is a TOML document; every section is optional:
//!
//! ```toml
//! [tenant]
//! name = "default"
//! multi_assignments_enabled = false
//! actions_autoclose_enabled = false
//!
//! [quota]
//! max_targets_per_manual_assignment = 5000
//! max_ids_per_batch = 1000
//!
//! [retry]
//! max_attempts = 3
//! backoff_ms = 200
//!
//! [scheduler]
//! action_page_limit = 1000
//! poll_interval_secs = 30
//!
//! [cleanup]
//! enabled = false
//! statuses = ["canceled", "error"]
//! expiry_days = 30
//! ```

use std::path::Path;
use std::time::Duration;

use fleetgrid_state::ActionState;
use serde::{Deserialize, Serialize};

use crate::error::{DeploymentError, DeploymentResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub tenant: TenantConfig,
    pub quota: QuotaConfig,
    pub retry: RetryConfig,
    pub scheduler: SchedulerConfig,
    pub cleanup: CleanupConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantConfig {
    pub name: String,
    pub multi_assignments_enabled: bool,
    pub actions_autoclose_enabled: bool,
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            multi_assignments_enabled: false,
            actions_autoclose_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub max_targets_per_manual_assignment: usize,
    /// Upper bound of ids in one store query.
    pub max_ids_per_batch: usize,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            max_targets_per_manual_assignment: 5000,
            max_ids_per_batch: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 200,
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub action_page_limit: usize,
    pub poll_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            action_page_limit: 1000,
            poll_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub enabled: bool,
    /// Action statuses eligible for deletion, e.g. `"canceled"`.
    pub statuses: Vec<String>,
    pub expiry_days: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            statuses: vec!["canceled".to_string(), "error".to_string()],
            expiry_days: 30,
        }
    }
}

impl CleanupConfig {
    /// Parse the configured statuses; only terminal statuses may be cleaned up.
    pub fn action_states(&self) -> DeploymentResult<Vec<ActionState>> {
        self.statuses
            .iter()
            .map(|s| {
                let state: ActionState = s.parse().map_err(DeploymentError::Config)?;
                if !state.is_terminal() {
                    return Err(DeploymentError::Config(format!(
                        "cleanup status {state} is not terminal"
                    )));
                }
                Ok(state)
            })
            .collect()
    }

    /// Retention period after which a terminal action may be deleted.
    pub fn expiry(&self) -> Duration {
        Duration::from_secs(self.expiry_days.saturating_mul(24 * 60 * 60))
    }
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> DeploymentResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DeploymentError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> DeploymentResult<Self> {
        let config: EngineConfig =
            toml::from_str(content).map_err(|e| DeploymentError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> DeploymentResult<()> {
        if self.quota.max_ids_per_batch == 0 {
            return Err(DeploymentError::Config(
                "quota.max_ids_per_batch must be positive".to_string(),
            ));
        }
        if self.scheduler.action_page_limit == 0 {
            return Err(DeploymentError::Config(
                "scheduler.action_page_limit must be positive".to_string(),
            ));
        }
        self.cleanup.action_states()?;
        Ok(())
    }
}

// ── Providers ──────────────────────────────────────────────────────

/// Boolean tenant configuration keys consulted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigKey {
    /// More than one active action per target is allowed.
    MultiAssignmentsEnabled,
    /// Superseded actions are closed instead of cancelled.
    ActionsAutocloseEnabled,
}

/// Source of per-tenant boolean settings.
pub trait TenantSettings: Send + Sync {
    fn tenant(&self) -> &str;

    fn get_bool(&self, key: ConfigKey) -> bool;
}

/// Source of count ceilings.
pub trait QuotaSettings: Send + Sync {
    fn max_targets_per_manual_assignment(&self) -> usize;

    fn max_ids_per_batch(&self) -> usize;
}

impl TenantSettings for EngineConfig {
    fn tenant(&self) -> &str {
        &self.tenant.name
    }

    fn get_bool(&self, key: ConfigKey) -> bool {
        match key {
            ConfigKey::MultiAssignmentsEnabled => self.tenant.multi_assignments_enabled,
            ConfigKey::ActionsAutocloseEnabled => self.tenant.actions_autoclose_enabled,
        }
    }
}

impl QuotaSettings for EngineConfig {
    fn max_targets_per_manual_assignment(&self) -> usize {
        self.quota.max_targets_per_manual_assignment
    }

    fn max_ids_per_batch(&self) -> usize {
        self.quota.max_ids_per_batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config.tenant.name, "default");
        assert_eq!(config.quota.max_targets_per_manual_assignment, 5000);
        assert_eq!(config.quota.max_ids_per_batch, 1000);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.backoff(), Duration::from_millis(200));
        assert_eq!(config.scheduler.action_page_limit, 1000);
        assert!(!config.cleanup.enabled);
        assert!(!config.get_bool(ConfigKey::MultiAssignmentsEnabled));
    }

    #[test]
    fn parses_partial_sections() {
        let config = EngineConfig::from_toml_str(
            r#"
            [tenant]
            name = "acme"
            actions_autoclose_enabled = true

            [cleanup]
            enabled = true
            statuses = ["CANCELED"]
            expiry_days = 7
            "#,
        )
        .unwrap();
        assert_eq!(config.tenant(), "acme");
        assert!(config.get_bool(ConfigKey::ActionsAutocloseEnabled));
        assert!(!config.get_bool(ConfigKey::MultiAssignmentsEnabled));
        assert_eq!(config.cleanup.action_states().unwrap(), vec![ActionState::Canceled]);
        assert_eq!(config.cleanup.expiry(), Duration::from_secs(7 * 86_400));
        assert_eq!(config.max_ids_per_batch(), 1000);
    }

    #[test]
    fn rejects_non_terminal_cleanup_status() {
        let err = EngineConfig::from_toml_str(
            r#"
            [cleanup]
            statuses = ["running"]
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, DeploymentError::Config(_)));
    }

    #[test]
    fn huge_expiry_saturates() {
        let cleanup = CleanupConfig {
            expiry_days: u64::MAX,
            ..CleanupConfig::default()
        };
        assert_eq!(cleanup.expiry(), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn rejects_zero_batch_size() {
        let err = EngineConfig::from_toml_str("[quota]\nmax_ids_per_batch = 0\n").unwrap_err();
        assert!(err.to_string().contains("max_ids_per_batch"));
    }

    #[test]
    fn reads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleetgrid.toml");
        std::fs::write(&path, "[retry]\nmax_attempts = 5\n").unwrap();
        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.retry.max_attempts, 5);

        let missing = EngineConfig::from_file(&dir.path().join("nope.toml"));
        assert!(matches!(missing, Err(DeploymentError::Config(_))));
    }
}
