//! CLI command implementations

use anyhow::{Context, Result};
use dialoguer::Confirm;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::ledger::gateway::LedgerContracts;
use crate::ledger::membership::is_valid_address;
use crate::ledger::{GatewayLedger, HttpMembershipSource, Ledger};
use crate::migration::types::{format_units, parse_amount, Chain, LedgerSide};
use crate::migration::{MigrationDriver, ProgressLedger};

/// Operator overrides for a migration run
#[derive(Debug, Clone, Default)]
pub struct RunArgs {
    pub dry_run: bool,
    pub yes: bool,
    pub parallelism: Option<usize>,
    pub dust: Option<String>,
    pub divisor: Option<u64>,
    pub skip_funding: bool,
    pub skip_membership_sync: bool,
    pub only: Vec<String>,
}

impl RunArgs {
    /// Layer the flags over the file/env configuration
    pub fn apply(&self, config: &mut Config) -> Result<()> {
        let m = &mut config.migration;

        if let Some(parallelism) = self.parallelism {
            m.parallelism = parallelism;
        }
        if let Some(dust) = &self.dust {
            m.dust_threshold =
                parse_amount(dust).with_context(|| format!("Invalid dust amount: {}", dust))?;
        }
        if let Some(divisor) = self.divisor {
            m.divisor = divisor;
        }
        m.skip_funding |= self.skip_funding;
        m.skip_membership_sync |= self.skip_membership_sync;
        if !self.only.is_empty() {
            m.whitelist = self.only.clone();
        }

        config.validate()
    }
}

/// Run the migration, returning the process exit code
pub async fn run(config: &Config, args: RunArgs) -> Result<i32> {
    let mut config = config.clone();
    args.apply(&mut config)?;
    let m = &config.migration;

    if args.dry_run {
        warn!("Running in DRY-RUN mode - no transactions will be sent");
    }

    info!(
        "Migrating {} -> {} / {} (operator {})",
        m.legacy_ledger, m.new_ledger_primary, m.new_ledger_secondary, m.operator
    );
    info!(
        "Parallelism: {}, dust threshold: {}, divisor: {}",
        m.parallelism,
        format_units(m.dust_threshold, m.token_decimals),
        m.divisor
    );

    // Confirmation prompt (unless --yes)
    if !args.yes && !args.dry_run {
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Migrate balances from {} to {}? Transfers are signed by {} and cannot be undone.",
                m.legacy_ledger, m.new_ledger_secondary, m.operator
            ))
            .default(false)
            .interact()?;

        if !confirmed {
            info!("Migration cancelled by user");
            return Ok(0);
        }
    }

    let ledger = Arc::new(GatewayLedger::new(
        config.ledger.clone(),
        LedgerContracts::from(m),
    )?);
    let membership = Arc::new(HttpMembershipSource::new(&config.membership)?);
    let progress = Arc::new(
        ProgressLedger::open(&config.progress.records_path, Uuid::new_v4()).await?,
    );
    info!(
        "Run {} recording to {}",
        progress.run_id(),
        progress.path().display()
    );

    // Ctrl-C stops scheduling; in-flight transfers finish and progress is snapshotted
    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received shutdown signal, letting in-flight transfers finish...");
            signal.cancel();
        }
    });

    let driver = MigrationDriver::new(config.clone(), ledger, membership, progress, cancel)
        .dry_run(args.dry_run);
    let report = driver.run().await?;

    println!("\n=== MIGRATION REPORT ===\n");
    println!("{}", report);

    Ok(report.exit_code())
}

/// Print the transfer audit trail
pub async fn records(config: &Config, limit: usize, account: Option<String>) -> Result<()> {
    if let Some(account) = &account {
        if !is_valid_address(account) {
            anyhow::bail!("Invalid account address: {}", account);
        }
    }

    let all = ProgressLedger::load(&config.progress.records_path).await?;
    let matching: Vec<_> = all
        .iter()
        .filter(|r| match &account {
            Some(a) => r.account.eq_ignore_ascii_case(a),
            None => true,
        })
        .collect();

    println!("\n=== TRANSFER RECORDS ===\n");

    if matching.is_empty() {
        println!("No transfer records found.");
        println!();
        return Ok(());
    }

    let decimals = config.migration.token_decimals;
    println!(
        "{:<20} {:<44} {:>24} {:<9} {:<14}",
        "DATE", "ACCOUNT", "AMOUNT", "SETTLED", "TX"
    );
    println!("{}", "-".repeat(115));

    let skip = matching.len().saturating_sub(limit);
    for record in matching.iter().skip(skip) {
        println!(
            "{:<20} {:<44} {:>24} {:<9} {:<14}",
            record.timestamp.format("%Y-%m-%d %H:%M:%S"),
            record.account,
            format_units(record.amount, decimals),
            if record.satisfied { "yes" } else { "partial" },
            short_hash(&record.tx_hash)
        );
    }

    let total: u128 = matching.iter().map(|r| r.amount).sum();
    println!();
    println!(
        "{} records, {} transferred",
        matching.len(),
        format_units(total, decimals)
    );
    println!();
    Ok(())
}

fn short_hash(tx_hash: &str) -> String {
    if tx_hash.chars().count() > 12 {
        format!("{}...", tx_hash.chars().take(12).collect::<String>())
    } else {
        tx_hash.to_string()
    }
}

/// Show current configuration (secrets masked)
pub fn show_config(config: &Config) -> Result<()> {
    println!("{}", config.masked_display());
    Ok(())
}

/// Check gateway reachability, contracts and operator balances
pub async fn health(config: &Config) -> Result<()> {
    println!("\n=== SYSTEM HEALTH CHECK ===\n");

    let m = &config.migration;
    let ledger = GatewayLedger::new(config.ledger.clone(), LedgerContracts::from(m))?;
    let mut all_healthy = true;

    // Gateway
    print!("Ledger gateway... ");
    let start = Instant::now();
    match ledger.transaction_count(Chain::Secondary, &m.operator).await {
        Ok(nonce) => println!(
            "OK ({}ms, operator nonce {})",
            start.elapsed().as_millis(),
            nonce
        ),
        Err(e) => {
            println!("FAILED: {}", e);
            all_healthy = false;
        }
    }

    // Contracts
    for (name, chain, address) in [
        ("Legacy ledger", Chain::Primary, &m.legacy_ledger),
        ("New ledger (primary)", Chain::Primary, &m.new_ledger_primary),
        ("New ledger (secondary)", Chain::Secondary, &m.new_ledger_secondary),
    ] {
        print!("{}... ", name);
        match ledger.code_at(chain, address).await {
            Ok(code) if !code.is_empty() => println!("OK ({} bytes of code)", code.len()),
            Ok(_) => {
                println!("FAILED: no contract at {} on {}", address, chain);
                all_healthy = false;
            }
            Err(e) => {
                println!("FAILED: {}", e);
                all_healthy = false;
            }
        }
    }

    // Token identity
    print!("Token identity... ");
    match tokio::try_join!(
        ledger.token_address(LedgerSide::Legacy),
        ledger.token_address(LedgerSide::New)
    ) {
        Ok((old, new)) if old.eq_ignore_ascii_case(&new) => println!("OK ({})", old),
        Ok((old, new)) => {
            println!("FAILED: legacy uses {}, new uses {}", old, new);
            all_healthy = false;
        }
        Err(e) => {
            println!("FAILED: {}", e);
            all_healthy = false;
        }
    }

    print!("Credited on new ledger... ");
    match ledger.total_migrated().await {
        Ok(total) => println!("{}", format_units(total, m.token_decimals)),
        Err(e) => {
            println!("FAILED: {}", e);
            all_healthy = false;
        }
    }

    // Operator balances
    for chain in [Chain::Primary, Chain::Secondary] {
        print!("Operator balance ({})... ", chain);
        match ledger.token_balance(chain, &m.operator).await {
            Ok(balance) => println!("{}", format_units(balance, m.token_decimals)),
            Err(e) => {
                println!("FAILED: {}", e);
                all_healthy = false;
            }
        }
    }

    println!();
    if all_healthy {
        println!("All systems healthy!");
    } else {
        println!("Some systems are unhealthy. Check the errors above.");
    }

    Ok(())
}
