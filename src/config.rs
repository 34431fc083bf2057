//! Configuration management for Tollgate.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TollgateError};
use crate::quota::{Period, QuotaConfiguration, QuotaRule};

/// Limit value meaning "unlimited" in configuration files.
pub const UNLIMITED_LIMIT: i64 = -1;

/// Main configuration for an embedded Tollgate engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Quota limits
    #[serde(default)]
    pub quotas: QuotasConfig,

    /// Usage ledger persistence
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Comma-separated identities exempt from every limit.
    #[serde(default)]
    pub privileged_identities: String,
}

impl Default for TollgateConfig {
    fn default() -> Self {
        Self {
            quotas: QuotasConfig::default(),
            persistence: PersistenceConfig::default(),
            privileged_identities: String::new(),
        }
    }
}

/// Quota limit settings: one global limit plus optional per-command
/// limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotasConfig {
    /// Caps total actions per identity across all commands.
    #[serde(default = "default_global_limit")]
    pub global: LimitSetting,

    /// Caps actions per identity for a single command. A command absent
    /// here has no cap of its own.
    #[serde(default)]
    pub commands: HashMap<String, LimitSetting>,
}

impl Default for QuotasConfig {
    fn default() -> Self {
        Self {
            global: default_global_limit(),
            commands: HashMap::new(),
        }
    }
}

/// A limit+period pair as written in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitSetting {
    /// Hard cap, or [`UNLIMITED_LIMIT`].
    pub limit: i64,
    /// Rolling window the cap applies over.
    pub period: Period,
}

fn default_global_limit() -> LimitSetting {
    LimitSetting {
        limit: UNLIMITED_LIMIT,
        period: Period::Daily,
    }
}

/// Usage ledger persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Enables load-at-startup and save-on-record.
    #[serde(default)]
    pub enabled: bool,

    /// Ledger file location.
    #[serde(default = "default_ledger_path")]
    pub path: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_ledger_path(),
        }
    }
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from("usage_ledger.json")
}

impl QuotasConfig {
    /// Build the validated rule set the engine consumes.
    ///
    /// `-1` drops the tier entirely (unlimited); any other negative
    /// limit is a configuration error and aborts startup.
    pub fn build(&self) -> Result<QuotaConfiguration> {
        let global = Self::build_rule("global", &self.global)?;

        let mut per_scope = HashMap::new();
        for (command, setting) in &self.commands {
            if let Some(rule) = Self::build_rule(command, setting)? {
                per_scope.insert(command.clone(), rule);
            }
        }

        Ok(QuotaConfiguration::new(global, per_scope))
    }

    fn build_rule(name: &str, setting: &LimitSetting) -> Result<Option<QuotaRule>> {
        match setting.limit {
            UNLIMITED_LIMIT => Ok(None),
            limit if limit >= 0 => {
                let limit = u32::try_from(limit).map_err(|_| {
                    TollgateError::Config(format!("Limit for {} out of range: {}", name, limit))
                })?;
                Ok(Some(QuotaRule {
                    limit,
                    period: setting.period,
                }))
            }
            limit => Err(TollgateError::Config(format!(
                "Invalid limit for {}: {} (use -1 for unlimited)",
                name, limit
            ))),
        }
    }
}

impl TollgateConfig {
    /// Parse the privileged-identity list into a set, trimming
    /// whitespace and dropping empty entries.
    pub fn privileged_set(&self) -> HashSet<String> {
        self.privileged_identities
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&contents).map_err(|e| TollgateError::Config(e.to_string()))
    }

    /// Load configuration from an optional file with `TOLLGATE_`
    /// environment overrides layered on top.
    ///
    /// Nested keys use `__` in the environment, e.g.
    /// `TOLLGATE_QUOTAS__GLOBAL__LIMIT=25`.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        builder
            .add_source(
                config::Environment::with_prefix("TOLLGATE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(config::Config::try_deserialize)
            .map_err(|e| TollgateError::Config(e.to_string()))
    }
}
