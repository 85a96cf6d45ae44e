//! Configuration loading and validation

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::ledger::membership::is_valid_address;
use crate::migration::types::{amount_string, format_units, Amount};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub membership: MembershipConfig,
    pub migration: MigrationConfig,
    #[serde(default)]
    pub funding: FundingConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
}

/// Ledger gateway connection
#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// How long to wait for a transaction to be included
    #[serde(default = "default_receipt_timeout_ms")]
    pub receipt_timeout_ms: u64,
    #[serde(default = "default_receipt_poll_ms")]
    pub receipt_poll_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            gateway_url: default_gateway_url(),
            api_key: String::new(),
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            receipt_timeout_ms: default_receipt_timeout_ms(),
            receipt_poll_ms: default_receipt_poll_ms(),
        }
    }
}

/// Membership / earnings API
#[derive(Debug, Clone, Deserialize)]
pub struct MembershipConfig {
    #[serde(default = "default_membership_url")]
    pub api_url: String,
    /// Ledger ID to list members for, defaults to the legacy ledger address
    #[serde(default)]
    pub ledger_id: Option<String>,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            api_url: default_membership_url(),
            ledger_id: None,
            page_size: default_page_size(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Migration engine settings
#[derive(Debug, Clone, Deserialize)]
pub struct MigrationConfig {
    /// Legacy ledger contract (primary chain)
    pub legacy_ledger: String,
    /// New ledger contract, primary-chain half
    pub new_ledger_primary: String,
    /// New ledger contract, secondary-chain half
    pub new_ledger_secondary: String,
    /// Operating wallet (signing identity)
    pub operator: String,

    /// Scale down every member's earnings by this factor (test runs)
    #[serde(default = "default_divisor")]
    pub divisor: u64,
    /// Concurrent transfer attempts per round
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// Owed amounts at or below this are not worth migrating
    #[serde(default, with = "amount_string")]
    pub dust_threshold: Amount,
    /// Cap for a single transfer, the rest is paid in later rounds
    #[serde(default, with = "amount_string::option")]
    pub max_transfer_amount: Option<Amount>,
    /// Consecutive transient failures before an account is given up on
    #[serde(default = "default_max_transient_attempts")]
    pub max_transient_attempts: u32,
    /// Members added per membership-sync transaction
    #[serde(default = "default_sync_batch_size")]
    pub sync_batch_size: usize,
    #[serde(default)]
    pub skip_funding: bool,
    #[serde(default)]
    pub skip_membership_sync: bool,
    /// Only migrate these addresses (empty = everyone)
    #[serde(default)]
    pub whitelist: Vec<String>,
    #[serde(default = "default_token_decimals")]
    pub token_decimals: u32,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            legacy_ledger: String::new(),
            new_ledger_primary: String::new(),
            new_ledger_secondary: String::new(),
            operator: String::new(),
            divisor: default_divisor(),
            parallelism: default_parallelism(),
            dust_threshold: 0,
            max_transfer_amount: None,
            max_transient_attempts: default_max_transient_attempts(),
            sync_batch_size: default_sync_batch_size(),
            skip_funding: false,
            skip_membership_sync: false,
            whitelist: Vec::new(),
            token_decimals: default_token_decimals(),
        }
    }
}

/// Bridge funding settings
#[derive(Debug, Clone, Deserialize)]
pub struct FundingConfig {
    /// How often to re-read the secondary balance while waiting for the bridge
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Give up waiting for bridged funds after this long
    #[serde(default = "default_bridge_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for FundingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            timeout_secs: default_bridge_timeout_secs(),
        }
    }
}

/// Audit trail location
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressConfig {
    #[serde(default = "default_records_path")]
    pub records_path: String,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            records_path: default_records_path(),
        }
    }
}

fn default_gateway_url() -> String {
    "http://localhost:8080/api/v1".to_string()
}

fn default_membership_url() -> String {
    "http://localhost:8081/api/v1".to_string()
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    250
}

fn default_receipt_timeout_ms() -> u64 {
    300_000
}

fn default_receipt_poll_ms() -> u64 {
    2_000
}

fn default_page_size() -> usize {
    500
}

fn default_divisor() -> u64 {
    1
}

fn default_parallelism() -> usize {
    1
}

fn default_max_transient_attempts() -> u32 {
    5
}

fn default_sync_batch_size() -> usize {
    100
}

fn default_token_decimals() -> u32 {
    18
}

fn default_poll_interval_ms() -> u64 {
    10_000
}

fn default_bridge_timeout_secs() -> u64 {
    1_800
}

fn default_records_path() -> String {
    "migration-records.jsonl".to_string()
}

impl Config {
    /// Load configuration from file and environment variables
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            // Start with defaults
            .set_default("ledger.gateway_url", default_gateway_url())?
            .set_default("ledger.timeout_ms", default_timeout_ms() as i64)?
            .set_default("ledger.max_retries", default_max_retries() as i64)?
            .set_default("membership.api_url", default_membership_url())?
            // Load from file if exists
            .add_source(config::File::from(path).required(false))
            // Override with environment variables (prefix MIGRATE_)
            .add_source(
                config::Environment::with_prefix("MIGRATE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Membership ledger ID, falling back to the legacy ledger address
    pub fn membership_ledger_id(&self) -> &str {
        self.membership
            .ledger_id
            .as_deref()
            .unwrap_or(&self.migration.legacy_ledger)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let m = &self.migration;

        for (name, address) in [
            ("legacy_ledger", &m.legacy_ledger),
            ("new_ledger_primary", &m.new_ledger_primary),
            ("new_ledger_secondary", &m.new_ledger_secondary),
            ("operator", &m.operator),
        ] {
            if !is_valid_address(address) {
                anyhow::bail!("migration.{} is not a valid address: {:?}", name, address);
            }
        }

        for address in &m.whitelist {
            if !is_valid_address(address) {
                anyhow::bail!("Invalid whitelist address: {}", address);
            }
        }

        if m.divisor == 0 {
            anyhow::bail!("divisor must be at least 1");
        }

        if m.parallelism == 0 {
            anyhow::bail!("parallelism must be at least 1");
        }

        if m.sync_batch_size == 0 {
            anyhow::bail!("sync_batch_size must be at least 1");
        }

        if m.max_transient_attempts == 0 {
            anyhow::bail!("max_transient_attempts must be at least 1");
        }

        if let Some(cap) = m.max_transfer_amount {
            if cap <= m.dust_threshold {
                anyhow::bail!("max_transfer_amount must exceed dust_threshold");
            }
        }

        if m.token_decimals > 38 {
            anyhow::bail!("token_decimals cannot exceed 38");
        }

        url::Url::parse(&self.ledger.gateway_url)
            .with_context(|| format!("Invalid gateway_url: {}", self.ledger.gateway_url))?;
        url::Url::parse(&self.membership.api_url)
            .with_context(|| format!("Invalid membership api_url: {}", self.membership.api_url))?;

        if self.funding.poll_interval_ms == 0 || self.funding.timeout_secs == 0 {
            anyhow::bail!("funding poll_interval_ms and timeout_secs must be positive");
        }

        if m.parallelism > 1 {
            tracing::warn!(
                "parallelism={} - transfers will be submitted concurrently",
                m.parallelism
            );
        }

        Ok(())
    }

    /// Get masked configuration for display (hide secrets)
    pub fn masked_display(&self) -> String {
        let m = &self.migration;
        format!(
            r#"Configuration:
  Ledger gateway:
    url: {}
    api_key: {}
    timeout: {}ms
  Membership:
    api_url: {}
    ledger_id: {}
  Migration:
    legacy_ledger: {}
    new_ledger: {} (primary) / {} (secondary)
    operator: {}
    divisor: {}
    parallelism: {}
    dust_threshold: {}
    max_transfer: {}
    skip_funding: {}
    skip_membership_sync: {}
    whitelist: {} addresses
  Funding:
    poll_interval: {}ms
    timeout: {}s
  Progress:
    records_path: {}
"#,
            mask_url(&self.ledger.gateway_url),
            if self.ledger.api_key.is_empty() {
                "(not set)"
            } else {
                "***"
            },
            self.ledger.timeout_ms,
            mask_url(&self.membership.api_url),
            self.membership_ledger_id(),
            m.legacy_ledger,
            m.new_ledger_primary,
            m.new_ledger_secondary,
            m.operator,
            m.divisor,
            m.parallelism,
            format_units(m.dust_threshold, m.token_decimals),
            m.max_transfer_amount
                .map(|a| format_units(a, m.token_decimals))
                .unwrap_or_else(|| "(none)".to_string()),
            m.skip_funding,
            m.skip_membership_sync,
            m.whitelist.len(),
            self.funding.poll_interval_ms,
            self.funding.timeout_secs,
            self.progress.records_path,
        )
    }
}

/// Mask URL for display (hide API keys in query params)
fn mask_url(url: &str) -> String {
    if let Some(idx) = url.find('?') {
        format!("{}?***", &url[..idx])
    } else {
        url.to_string()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ledger: LedgerConfig::default(),
            membership: MembershipConfig::default(),
            migration: MigrationConfig::default(),
            funding: FundingConfig::default(),
            progress: ProgressConfig::default(),
        }
    }
}
