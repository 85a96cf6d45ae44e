//! Top-level migration control loop
//!
//! ```text
//! preflight → load members → sync membership → fund → rounds → report
//! ```
//!
//! Rounds run until the queue is empty, its head is at or below the dust
//! threshold, or cancellation is requested. The progress ledger is
//! snapshotted on every exit path.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::ledger::membership::build_accounts;
use crate::ledger::{Ledger, MembershipSource};
use crate::migration::funding::{required_total, BridgePoll, FundingCoordinator};
use crate::migration::nonce::NonceSequencer;
use crate::migration::progress::ProgressLedger;
use crate::migration::report::{AccountReport, MigrationReport};
use crate::migration::resolver::AmountResolver;
use crate::migration::scheduler::MigrationScheduler;
use crate::migration::sync::MembershipSync;
use crate::migration::types::{format_units, Account, Chain, LedgerSide, RetireReason};
use crate::migration::worker::{Attempt, Outcome, TransferWorkerPool, WorkerSettings};

pub struct MigrationDriver {
    config: Config,
    ledger: Arc<dyn Ledger>,
    membership: Arc<dyn MembershipSource>,
    progress: Arc<ProgressLedger>,
    dry_run: bool,
    cancel: CancellationToken,
}

impl MigrationDriver {
    pub fn new(
        config: Config,
        ledger: Arc<dyn Ledger>,
        membership: Arc<dyn MembershipSource>,
        progress: Arc<ProgressLedger>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            ledger,
            membership,
            progress,
            dry_run: false,
            cancel,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Both ledgers must be deployed and must move the same token
    pub async fn preflight(&self) -> Result<()> {
        let m = &self.config.migration;

        for (chain, address) in [
            (Chain::Primary, &m.legacy_ledger),
            (Chain::Primary, &m.new_ledger_primary),
            (Chain::Secondary, &m.new_ledger_secondary),
        ] {
            if self.ledger.code_at(chain, address).await?.is_empty() {
                return Err(Error::MissingContract {
                    chain: chain.to_string(),
                    address: address.clone(),
                });
            }
        }

        let (old, new) = tokio::try_join!(
            self.ledger.token_address(LedgerSide::Legacy),
            self.ledger.token_address(LedgerSide::New)
        )?;
        if !old.eq_ignore_ascii_case(&new) {
            return Err(Error::TokenMismatch { old, new });
        }

        info!("Preflight passed, token {}", old);
        Ok(())
    }

    /// Run the migration and snapshot progress however it ends
    pub async fn run(&self) -> Result<MigrationReport> {
        let result = self.execute().await;

        let records = match self.progress.snapshot().await {
            Ok(records) => records,
            Err(e) => {
                error!("Failed to snapshot progress: {}", e);
                return Err(result.err().unwrap_or(e));
            }
        };

        match result {
            Ok(mut report) => {
                report.records = records;
                report.finished_at = Utc::now();
                Ok(report)
            }
            Err(e) => {
                error!(
                    "Migration aborted after {} transfers this run: {}",
                    records.len(),
                    e
                );
                Err(e)
            }
        }
    }

    async fn execute(&self) -> Result<MigrationReport> {
        let started_at = Utc::now();
        let m = &self.config.migration;

        if self.dry_run {
            warn!("DRY RUN MODE - no transactions will be sent");
        }

        self.preflight().await?;

        let records = self
            .membership
            .list_members(self.config.membership_ledger_id())
            .await?;
        let accounts = build_accounts(records, &m.whitelist)?;
        info!("Loaded {} accounts to migrate", accounts.len());

        let primary = Arc::new(NonceSequencer::new(
            self.ledger.clone(),
            Chain::Primary,
            m.operator.clone(),
        ));
        let secondary = Arc::new(NonceSequencer::new(
            self.ledger.clone(),
            Chain::Secondary,
            m.operator.clone(),
        ));
        let resolver = AmountResolver::new(self.ledger.clone(), m.divisor);

        if m.skip_membership_sync {
            info!("Skipping membership sync");
        } else {
            let summary = MembershipSync::new(self.ledger.clone(), secondary.clone(), m.sync_batch_size)
                .dry_run(self.dry_run)
                .sync(&accounts)
                .await?;
            info!(
                "Membership synced: {} added in {} batches, {} already active",
                summary.added, summary.batches, summary.already_active
            );
        }

        if m.skip_funding {
            warn!("Skipping funding check, transfers may revert if the wallet is short");
        } else {
            let required = required_total(self.ledger.as_ref(), &accounts, &resolver).await?;
            info!(
                "Required funding {} for {} accounts",
                format_units(required, m.token_decimals),
                accounts.len()
            );

            let funding = FundingCoordinator::new(
                self.ledger.clone(),
                primary.clone(),
                secondary.clone(),
                m.operator.clone(),
                m.new_ledger_secondary.clone(),
                BridgePoll {
                    interval: Duration::from_millis(self.config.funding.poll_interval_ms),
                    timeout: Duration::from_secs(self.config.funding.timeout_secs),
                },
            )
            .dry_run(self.dry_run)
            .with_cancellation(self.cancel.clone());

            funding.ensure_funded(required).await?;
            funding.ensure_allowance(required).await?;
        }

        let pool = TransferWorkerPool::new(
            self.ledger.clone(),
            resolver.clone(),
            secondary,
            self.progress.clone(),
            WorkerSettings {
                run_id: self.progress.run_id(),
                parallelism: m.parallelism,
                dust_threshold: m.dust_threshold,
                max_transfer_amount: m.max_transfer_amount,
                max_transient_attempts: m.max_transient_attempts,
                dry_run: self.dry_run,
            },
            self.cancel.clone(),
        );
        let mut scheduler = MigrationScheduler::new(accounts, resolver, m.dust_threshold);

        let mut round = 0u64;
        let mut interrupted = false;

        loop {
            if self.cancel.is_cancelled() {
                warn!("Interrupted before round {}, stopping", round + 1);
                interrupted = true;
                break;
            }

            scheduler.resort();
            if scheduler.is_exhausted() {
                let below = scheduler.retire_remaining();
                if below > 0 {
                    info!("{} accounts left at or below the dust threshold", below);
                }
                break;
            }

            round += 1;
            let batch = scheduler.next_batch(m.parallelism);
            let attempts = pool.run_round(batch, round).await;

            let mut fatal = None;
            for Attempt { account, outcome } in attempts {
                match outcome {
                    Ok(outcome) => apply(&mut scheduler, account, outcome),
                    Err(e) => {
                        error!("Fatal error on {}: {}", account.address, e);
                        scheduler.reinsert(account);
                        fatal.get_or_insert(e);
                    }
                }
            }
            if let Some(e) = fatal {
                return Err(e);
            }

            info!(
                "Round {}: {} queued ({} outstanding), {} retired",
                round,
                scheduler.len(),
                format_units(scheduler.outstanding(), m.token_decimals),
                scheduler.retired().len()
            );
        }

        let (retired, queued) = scheduler.into_parts();
        let mut accounts: Vec<(u64, AccountReport)> = retired
            .into_iter()
            .map(|(account, reason)| (account.seq, AccountReport::retired(&account, reason)))
            .chain(queued.iter().map(|a| (a.seq, AccountReport::pending(a))))
            .collect();
        accounts.sort_by_key(|(seq, _)| *seq);

        Ok(MigrationReport {
            run_id: self.progress.run_id(),
            started_at,
            finished_at: Utc::now(),
            dry_run: self.dry_run,
            interrupted,
            rounds: round,
            accounts: accounts.into_iter().map(|(_, a)| a).collect(),
            records: Vec::new(),
            token_decimals: m.token_decimals,
        })
    }
}

fn apply(scheduler: &mut MigrationScheduler, account: Account, outcome: Outcome) {
    match outcome {
        Outcome::Resolved | Outcome::Transient(_) | Outcome::Skipped => scheduler.reinsert(account),
        Outcome::Transferred { satisfied, .. } => {
            if satisfied {
                scheduler.retire(account, RetireReason::Satisfied);
            } else {
                scheduler.reinsert(account);
            }
        }
        Outcome::Planned(amount) => scheduler.retire(account, RetireReason::Planned(amount)),
        Outcome::BelowThreshold => scheduler.retire(account, RetireReason::BelowThreshold),
        Outcome::Failed(reason) => scheduler.retire(account, RetireReason::Failed(reason)),
    }
}
