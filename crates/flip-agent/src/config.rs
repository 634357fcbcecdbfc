//! Agent configuration loading, environment secrets, and validation.

use serde::{Deserialize, Serialize};
use std::path::Path;

use flip_core::SettlementConfig;
use flip_scoring::{AgentProfile, FixedPolicy, PolicyKind, ScorerConfig};
use flip_settlement::adapters::{EvmLedgerConfig, FdcConfig, XrplRailConfig};
use flip_settlement::SettlementError;

pub const ENV_PRIVATE_KEY: &str = "FLIP_PRIVATE_KEY";
pub const ENV_XRPL_SECRET: &str = "FLIP_XRPL_SECRET";
pub const ENV_FDC_API_KEY: &str = "FLIP_FDC_API_KEY";

/// Full configuration for the settlement agent.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FlipConfig {
    /// Ledger node, contract addresses, and operator key.
    #[serde(default)]
    pub ledger: EvmLedgerConfig,

    /// XRPL payment rail.
    #[serde(default)]
    pub xrpl: XrplRailConfig,

    /// Attestation network endpoints and round timing.
    #[serde(default)]
    pub fdc: FdcConfig,

    /// Pipeline tunables and scoring policy.
    #[serde(default)]
    pub agent: AgentConfig,

    /// Status API settings.
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(flatten)]
    pub settlement: SettlementConfig,
    #[serde(default = "default_policy")]
    pub scoring_policy: PolicyKind,
    /// Tuples used when `scoring_policy = "fixed"`.
    #[serde(default)]
    pub fixed: FixedPolicy,
    /// Scorer parameters used when `scoring_policy = "deterministic"`.
    #[serde(default)]
    pub scorer: ScorerConfig,
    #[serde(default)]
    pub profile: AgentProfile,
    /// Volatility fed to the deterministic scorer until a price window is
    /// posted to `/api/v1/prices`. Stays fixed if nothing posts.
    #[serde(default = "default_initial_volatility")]
    pub initial_volatility: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_api_addr")]
    pub listen_addr: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log format (text, json).
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_policy() -> PolicyKind {
    PolicyKind::Fixed
}
fn default_initial_volatility() -> u64 {
    10_000
}
fn default_true() -> bool {
    true
}
fn default_api_addr() -> String {
    "127.0.0.1".into()
}
fn default_api_port() -> u16 {
    9101
}
fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            settlement: SettlementConfig::default(),
            scoring_policy: default_policy(),
            fixed: FixedPolicy::default(),
            scorer: ScorerConfig::default(),
            profile: AgentProfile::default(),
            initial_volatility: default_initial_volatility(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: default_api_addr(),
            port: default_api_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl FlipConfig {
    /// Load config from a TOML file, falling back to defaults for missing fields.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            let config: FlipConfig = toml::from_str(&contents)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save the current config to a TOML file. Secrets are not written.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Override secrets from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_secrets(|name| std::env::var(name).ok());
    }

    fn apply_secrets(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let present = |name: &str| lookup(name).filter(|v| !v.is_empty());
        if let Some(key) = present(ENV_PRIVATE_KEY) {
            self.ledger.private_key = key;
        }
        if let Some(secret) = present(ENV_XRPL_SECRET) {
            self.xrpl.secret = secret;
        }
        if let Some(key) = present(ENV_FDC_API_KEY) {
            self.fdc.api_key = key;
        }
    }

    /// Reject a configuration the agent cannot start with.
    ///
    /// Dry runs use in-memory collaborators and skip the endpoint and
    /// credential checks. Live runs need the EVM ledger, XRPL, and FDC
    /// settings together.
    pub fn validate(&self, dry_run: bool) -> Result<(), SettlementError> {
        self.agent
            .settlement
            .validate()
            .map_err(|e| SettlementError::Configuration(e.to_string()))?;
        self.agent
            .scorer
            .validate()
            .map_err(|e| SettlementError::Configuration(e.to_string()))?;
        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(SettlementError::Configuration(format!(
                "logging.format must be \"text\" or \"json\", got {:?}",
                self.logging.format
            )));
        }
        if dry_run {
            return Ok(());
        }

        if self.ledger.private_key.is_empty() {
            return Err(SettlementError::Configuration(format!(
                "operator key missing, set {}",
                ENV_PRIVATE_KEY
            )));
        }
        self.ledger.validate()?;
        if self.agent.settlement.liquidity_check
            && (self.ledger.lp_registry_address.is_zero()
                || self.ledger.liquidity_providers.is_empty())
        {
            return Err(SettlementError::Configuration(
                "liquidity_check needs ledger.lp_registry_address and ledger.liquidity_providers"
                    .into(),
            ));
        }
        if self.xrpl.rpc_url.trim().is_empty() {
            return Err(SettlementError::Configuration("xrpl.rpc_url is empty".into()));
        }
        if self.xrpl.account.trim().is_empty() {
            return Err(SettlementError::Configuration("xrpl.account is empty".into()));
        }
        if self.xrpl.secret.is_empty() {
            return Err(SettlementError::Configuration(format!(
                "XRPL secret missing, set {}",
                ENV_XRPL_SECRET
            )));
        }
        if self.fdc.verifier_url.trim().is_empty() || self.fdc.da_layer_url.trim().is_empty() {
            return Err(SettlementError::Configuration(
                "fdc.verifier_url and fdc.da_layer_url are required".into(),
            ));
        }
        Ok(())
    }
}
