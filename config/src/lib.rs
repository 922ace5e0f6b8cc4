//! Shielded Pool Configuration
//!
//! Shared configuration crate for the pool engine and its tools.
//!
//! Handles loading configuration from:
//! 1. SP_CONFIG env var (explicit path)
//! 2. ./shieldpool.toml (current directory)
//! 3. ~/.shieldpool/config.toml (user home)
//!
//! Environment variables take precedence over TOML config.

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::{env, fs};

/// Global config instance for convenience access
pub static GLOBAL_CONFIG: OnceLock<PoolConfig> = OnceLock::new();

const LOCAL_CONFIG_FILE: &str = "shieldpool.toml";
const CONFIG_FILE_NAME: &str = "config.toml";
const CONFIG_DIR_NAME: &str = ".shieldpool";

// ============================================================================
// Default Constants
// ============================================================================

const DEFAULT_TREE_HEIGHT: usize = 23;
const DEFAULT_ROOT_HISTORY_SIZE: usize = 100;
/// 1 ETH in wei
const DEFAULT_MAX_DEPOSIT: u64 = 1_000_000_000_000_000_000;
/// 0.01 ETH in wei
const DEFAULT_MIN_WITHDRAWAL: u64 = 10_000_000_000_000_000;
const DEFAULT_CONFIRMATION_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

const MAX_TREE_HEIGHT: usize = 32;

// ============================================================================
// Config Structs
// ============================================================================

/// Root configuration structure (matches TOML layout)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default)]
    pub tree: TreeConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub privacy: PrivacyConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Commitment tree shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeConfig {
    #[serde(default = "default_tree_height")]
    pub height: usize,
    #[serde(default = "default_root_history_size")]
    pub root_history_size: usize,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            height: DEFAULT_TREE_HEIGHT,
            root_history_size: DEFAULT_ROOT_HISTORY_SIZE,
        }
    }
}

fn default_tree_height() -> usize {
    DEFAULT_TREE_HEIGHT
}
fn default_root_history_size() -> usize {
    DEFAULT_ROOT_HISTORY_SIZE
}

/// Pool value limits, in base units
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_deposit")]
    pub max_deposit_amount: u64,
    /// Applies to cross-domain withdrawals only
    #[serde(default = "default_min_withdrawal")]
    pub min_withdrawal_amount: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_deposit_amount: DEFAULT_MAX_DEPOSIT,
            min_withdrawal_amount: DEFAULT_MIN_WITHDRAWAL,
        }
    }
}

fn default_max_deposit() -> u64 {
    DEFAULT_MAX_DEPOSIT
}
fn default_min_withdrawal() -> u64 {
    DEFAULT_MIN_WITHDRAWAL
}

/// Whether output notes of one transaction may share a blinding factor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlindingPolicy {
    #[default]
    Unique,
    AllowReuse,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivacyConfig {
    #[serde(default)]
    pub blinding_policy: BlindingPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_confirmation_timeout")]
    pub confirmation_timeout_ms: u64,
    /// How often the ledger is polled for a submitted transaction's outcome
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            confirmation_timeout_ms: DEFAULT_CONFIRMATION_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

fn default_confirmation_timeout() -> u64 {
    DEFAULT_CONFIRMATION_TIMEOUT_MS
}
fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Wallet checkpoint file; checkpointing is off when unset
    #[serde(default)]
    pub checkpoint_path: Option<String>,
}

// ============================================================================
// Environment Variable Helpers
// ============================================================================

type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

/// Set field from env var if present and parseable
fn env_parse<T: std::str::FromStr>(lookup: Lookup<'_>, key: &str, field: &mut T) {
    if let Some(v) = lookup(key) {
        match v.parse() {
            Ok(parsed) => *field = parsed,
            Err(_) => log::warn!("Ignoring unparseable {}={}", key, v),
        }
    }
}

/// Set Option<String> from env var if present
fn env_option_string(lookup: Lookup<'_>, key: &str, field: &mut Option<String>) {
    if let Some(v) = lookup(key) {
        *field = Some(v);
    }
}

// ============================================================================
// Implementation
// ============================================================================

impl PoolConfig {
    /// Load configuration from config file with env var overrides
    pub fn load() -> Result<Self> {
        let mut config = match Self::find_config_file() {
            Some(path) => {
                log::info!("Loading config from: {}", path.display());
                Self::parse_file(&path)?
            }
            None => {
                log::info!("No config file found, using defaults and environment variables");
                Self::default()
            }
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = Self::parse_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn parse_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Find the config file path
    fn find_config_file() -> Option<PathBuf> {
        // 1. Check SP_CONFIG env var
        if let Ok(path) = env::var("SP_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        // 2. Check ./shieldpool.toml (current directory)
        let local_path = PathBuf::from(LOCAL_CONFIG_FILE);
        if local_path.exists() {
            return Some(local_path);
        }

        // 3. Check ~/.shieldpool/config.toml
        Self::default_config_path().filter(|p| p.exists())
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(&|key| env::var(key).ok());
    }

    /// Apply `SP_*` overrides from an arbitrary source
    pub fn apply_overrides(&mut self, lookup: Lookup<'_>) {
        // Tree
        env_parse(lookup, "SP_TREE_HEIGHT", &mut self.tree.height);
        env_parse(lookup, "SP_ROOT_HISTORY_SIZE", &mut self.tree.root_history_size);

        // Limits
        env_parse(lookup, "SP_MAX_DEPOSIT", &mut self.limits.max_deposit_amount);
        env_parse(lookup, "SP_MIN_WITHDRAWAL", &mut self.limits.min_withdrawal_amount);

        // Privacy
        if let Some(v) = lookup("SP_BLINDING_POLICY") {
            self.privacy.blinding_policy = match v.to_ascii_lowercase().as_str() {
                "allow_reuse" | "allow-reuse" => BlindingPolicy::AllowReuse,
                _ => BlindingPolicy::Unique,
            };
        }

        // Timeouts
        env_parse(
            lookup,
            "SP_CONFIRMATION_TIMEOUT_MS",
            &mut self.timeouts.confirmation_timeout_ms,
        );
        env_parse(lookup, "SP_POLL_INTERVAL_MS", &mut self.timeouts.poll_interval_ms);

        // Storage
        env_option_string(lookup, "SP_CHECKPOINT_PATH", &mut self.storage.checkpoint_path);
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        ensure!(
            (1..=MAX_TREE_HEIGHT).contains(&self.tree.height),
            "tree.height must be between 1 and {}, got {}",
            MAX_TREE_HEIGHT,
            self.tree.height
        );
        ensure!(
            self.tree.root_history_size > 0,
            "tree.root_history_size must be positive"
        );
        ensure!(
            self.timeouts.confirmation_timeout_ms > 0,
            "timeouts.confirmation_timeout_ms must be positive"
        );
        ensure!(
            self.timeouts.poll_interval_ms > 0,
            "timeouts.poll_interval_ms must be positive"
        );
        Ok(())
    }

    /// Get the default config file path
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Generate a sample config file
    pub fn generate_sample() -> String {
        let mut sample = Self::default();
        sample.storage.checkpoint_path = Some("./shieldpool-wallet.json".into());
        toml::to_string_pretty(&sample).unwrap_or_default()
    }

    /// Get the global config instance, initializing it if necessary.
    ///
    /// Falls back to defaults if loading fails.
    pub fn global() -> &'static PoolConfig {
        GLOBAL_CONFIG.get_or_init(|| {
            Self::load().unwrap_or_else(|e| {
                log::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            })
        })
    }

    /// Try to get the global config instance.
    ///
    /// Returns `None` if config hasn't been initialized yet.
    pub fn try_global() -> Option<&'static PoolConfig> {
        GLOBAL_CONFIG.get()
    }

    /// Initialize the global config with a specific instance.
    ///
    /// Returns `Err(config)` if already initialized.
    pub fn set_global(config: PoolConfig) -> std::result::Result<(), PoolConfig> {
        GLOBAL_CONFIG.set(config)
    }
}

/// Shorthand for `PoolConfig::global()`.
#[inline]
pub fn global_config() -> &'static PoolConfig {
    PoolConfig::global()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = PoolConfig::default();
        assert_eq!(config.tree.height, 23);
        assert_eq!(config.tree.root_history_size, 100);
        assert_eq!(config.limits.max_deposit_amount, 1_000_000_000_000_000_000);
        assert_eq!(config.limits.min_withdrawal_amount, 10_000_000_000_000_000);
        assert_eq!(config.privacy.blinding_policy, BlindingPolicy::Unique);
        assert!(config.storage.checkpoint_path.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_generate_sample() {
        let sample = PoolConfig::generate_sample();
        assert!(sample.contains("[tree]"));
        assert!(sample.contains("[limits]"));
        assert!(sample.contains("[privacy]"));
        assert!(sample.contains("[storage]"));
    }

    #[test]
    fn test_parse_sample() {
        let sample = PoolConfig::generate_sample();
        let parsed: PoolConfig = toml::from_str(&sample).unwrap();
        assert_eq!(parsed.tree.height, DEFAULT_TREE_HEIGHT);
        assert_eq!(
            parsed.storage.checkpoint_path.as_deref(),
            Some("./shieldpool-wallet.json")
        );
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let parsed: PoolConfig = toml::from_str(
            r#"
            [tree]
            height = 5

            [privacy]
            blinding_policy = "allow_reuse"
            "#,
        )
        .unwrap();

        assert_eq!(parsed.tree.height, 5);
        assert_eq!(parsed.tree.root_history_size, DEFAULT_ROOT_HISTORY_SIZE);
        assert_eq!(parsed.privacy.blinding_policy, BlindingPolicy::AllowReuse);
        assert_eq!(parsed.timeouts, TimeoutConfig::default());
    }

    #[test]
    fn test_overrides_take_precedence() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("SP_TREE_HEIGHT", "10"),
            ("SP_MAX_DEPOSIT", "500"),
            ("SP_BLINDING_POLICY", "allow_reuse"),
            ("SP_CHECKPOINT_PATH", "/tmp/wallet.json"),
            ("SP_CONFIRMATION_TIMEOUT_MS", "not-a-number"),
        ]);

        let mut config = PoolConfig::default();
        config.apply_overrides(&|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.tree.height, 10);
        assert_eq!(config.limits.max_deposit_amount, 500);
        assert_eq!(config.privacy.blinding_policy, BlindingPolicy::AllowReuse);
        assert_eq!(config.storage.checkpoint_path.as_deref(), Some("/tmp/wallet.json"));
        // unparseable values are ignored
        assert_eq!(
            config.timeouts.confirmation_timeout_ms,
            DEFAULT_CONFIRMATION_TIMEOUT_MS
        );
    }

    #[test]
    fn test_validate_rejects_bad_height() {
        let mut config = PoolConfig::default();
        config.tree.height = 0;
        assert!(config.validate().is_err());

        config.tree.height = 33;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("tree.height"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[tree]\nheight = 7\n\n[limits]\nmin_withdrawal_amount = 3").unwrap();

        let config = PoolConfig::load_from(file.path()).unwrap();
        assert_eq!(config.tree.height, 7);
        assert_eq!(config.limits.min_withdrawal_amount, 3);
    }

    #[test]
    fn test_load_from_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[tree\nheight = ").unwrap();

        let err = PoolConfig::load_from(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }
}
