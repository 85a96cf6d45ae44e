//! Concurrent transfer attempts
//!
//! A round hands the pool an owned batch; every account comes back exactly
//! once with an outcome. The pool never touches the work queue.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::ledger::{Ledger, ReceiptStatus, TxRequest};
use crate::migration::nonce::NonceSequencer;
use crate::migration::progress::ProgressLedger;
use crate::migration::resolver::AmountResolver;
use crate::migration::types::{Account, Amount, InFlightTransfer, TransferRecord};

/// Per-run knobs for transfer attempts
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub run_id: Uuid,
    pub parallelism: usize,
    pub dust_threshold: Amount,
    pub max_transfer_amount: Option<Amount>,
    pub max_transient_attempts: u32,
    pub dry_run: bool,
}

/// What happened to one account in one round
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// First touch: owed amount is now known, nothing sent yet
    Resolved,
    /// Transfer included; `satisfied` when the remainder is at or below dust
    Transferred {
        amount: Amount,
        tx_hash: String,
        satisfied: bool,
    },
    /// Dry run: this transfer would have been sent
    Planned(Amount),
    /// Nothing worth migrating
    BelowThreshold,
    /// Excluded from further rounds
    Failed(String),
    /// Try again next round
    Transient(String),
    /// Not attempted because the run is shutting down
    Skipped,
}

/// An account handed back by the pool
#[derive(Debug)]
pub struct Attempt {
    pub account: Account,
    /// `Err` only for errors that must abort the run
    pub outcome: Result<Outcome>,
}

pub struct TransferWorkerPool {
    ledger: Arc<dyn Ledger>,
    resolver: AmountResolver,
    sequencer: Arc<NonceSequencer>,
    progress: Arc<ProgressLedger>,
    settings: WorkerSettings,
    cancel: CancellationToken,
}

impl TransferWorkerPool {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        resolver: AmountResolver,
        sequencer: Arc<NonceSequencer>,
        progress: Arc<ProgressLedger>,
        settings: WorkerSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ledger,
            resolver,
            sequencer,
            progress,
            settings,
            cancel,
        }
    }

    /// Run up to `parallelism` attempts at a time over `accounts`
    pub async fn run_round(&self, accounts: Vec<Account>, round: u64) -> Vec<Attempt> {
        let parallelism = self.settings.parallelism.max(1);
        debug!(
            "Round {}: {} accounts, parallelism {}",
            round,
            accounts.len(),
            parallelism
        );

        stream::iter(accounts)
            .map(|account| self.attempt(account, round))
            .buffer_unordered(parallelism)
            .collect()
            .await
    }

    async fn attempt(&self, mut account: Account, round: u64) -> Attempt {
        if self.cancel.is_cancelled() {
            return Attempt {
                account,
                outcome: Ok(Outcome::Skipped),
            };
        }

        let outcome = self.process(&mut account, round).await;
        let outcome = match outcome {
            Err(e) if e.is_retryable() => Ok(self.transient(&mut account, e.to_string())),
            other => other,
        };
        Attempt { account, outcome }
    }

    async fn process(&self, account: &mut Account, round: u64) -> Result<Outcome> {
        if let Some(in_flight) = account.in_flight.clone() {
            match self.settle(account, &in_flight).await? {
                Settlement::Landed(tx_hash) => {
                    account.invalidate();
                    let remaining = self.resolver.resolve(account, round).await?;
                    account.in_flight = None;
                    info!(
                        "Earlier transfer {} to {} confirmed ({} remaining)",
                        tx_hash, account.address, remaining
                    );
                    return self
                        .record_transfer(account, in_flight.amount, tx_hash, remaining)
                        .await;
                }
                Settlement::Reverted(reason) => {
                    account.in_flight = None;
                    return Ok(self.reject(account, reason));
                }
                Settlement::NotLanded => {
                    info!(
                        "Transfer to {} with nonce {} never reached the chain, sending again",
                        account.address, in_flight.nonce
                    );
                    account.in_flight = None;
                    account.invalidate();
                }
                Settlement::Unknown(reason) => return Ok(self.transient(account, reason)),
            }
        }

        let first_touch = !account.is_resolved();
        let owed = self.resolver.resolve(account, round).await?;

        if owed <= self.settings.dust_threshold {
            return Ok(Outcome::BelowThreshold);
        }
        if first_touch {
            return Ok(Outcome::Resolved);
        }

        let amount = match self.settings.max_transfer_amount {
            Some(cap) => owed.min(cap),
            None => owed,
        };

        if self.settings.dry_run {
            info!("[DRY RUN] Would transfer {} to {}", amount, account.address);
            return Ok(Outcome::Planned(amount));
        }

        let migrated_before = account.migrated_on_new.unwrap_or(0);
        let submitted = match self
            .sequencer
            .submit(&TxRequest::Transfer {
                to: account.address.clone(),
                amount,
            })
            .await
        {
            Ok(submitted) => submitted,
            Err(Error::Rejected(reason)) => return Ok(self.reject(account, reason)),
            Err(Error::SubmitUnknown { nonce, reason }) => {
                account.in_flight = Some(InFlightTransfer {
                    nonce,
                    tx_hash: None,
                    amount,
                    migrated_before,
                });
                return Ok(self.transient(account, format!("transfer sent blind: {}", reason)));
            }
            Err(e) => return Err(e),
        };

        // Past this point the transfer may land; it is settled before any resend
        let receipt = match self
            .ledger
            .wait_for_receipt(self.sequencer.chain(), &submitted.tx_hash)
            .await
        {
            Ok(receipt) => receipt,
            Err(e) if e.is_retryable() => {
                account.in_flight = Some(InFlightTransfer {
                    nonce: submitted.nonce,
                    tx_hash: Some(submitted.tx_hash.clone()),
                    amount,
                    migrated_before,
                });
                return Ok(self.transient(
                    account,
                    format!("transfer {} not confirmed: {}", submitted.tx_hash, e),
                ));
            }
            Err(e) => return Err(e),
        };

        if let ReceiptStatus::Reverted(reason) = receipt.status {
            return Ok(self.reject(account, reason));
        }

        account.migrated_on_new = Some(migrated_before + amount);
        info!(
            "Transferred {} to {} (block {}, {} remaining)",
            amount,
            account.address,
            receipt.block,
            owed - amount
        );
        self.record_transfer(account, amount, receipt.tx_hash, owed - amount)
            .await
    }

    /// Find out whether an unconfirmed transfer executed
    ///
    /// The receipt is tried first. Without one, a nonce the chain has not
    /// reached proves the transfer never landed; otherwise the account's
    /// migrated amount on the new ledger decides.
    async fn settle(&self, account: &Account, in_flight: &InFlightTransfer) -> Result<Settlement> {
        let chain = self.sequencer.chain();

        if let Some(tx_hash) = &in_flight.tx_hash {
            match self.ledger.wait_for_receipt(chain, tx_hash).await {
                Ok(receipt) => {
                    return Ok(match receipt.status {
                        ReceiptStatus::Success => Settlement::Landed(receipt.tx_hash),
                        ReceiptStatus::Reverted(reason) => Settlement::Reverted(reason),
                    })
                }
                Err(e) if e.is_retryable() => {
                    debug!("Receipt for {} still unavailable: {}", tx_hash, e)
                }
                Err(e) => return Err(e),
            }
        }

        let seen = self
            .ledger
            .transaction_count(chain, self.sequencer.identity())
            .await?;
        if seen <= in_flight.nonce {
            return Ok(Settlement::NotLanded);
        }

        let migrated = self.ledger.migrated(&account.address).await?;
        if migrated >= in_flight.migrated_before + in_flight.amount {
            let tx_hash = in_flight
                .tx_hash
                .clone()
                .unwrap_or_else(|| format!("nonce:{}", in_flight.nonce));
            return Ok(Settlement::Landed(tx_hash));
        }

        Ok(Settlement::Unknown(format!(
            "nonce {} is taken but the transfer of {} has not executed",
            in_flight.nonce, in_flight.amount
        )))
    }

    async fn record_transfer(
        &self,
        account: &mut Account,
        amount: Amount,
        tx_hash: String,
        remaining: Amount,
    ) -> Result<Outcome> {
        let satisfied = remaining <= self.settings.dust_threshold;

        self.progress
            .record(TransferRecord::new(
                self.settings.run_id,
                &account.address,
                amount,
                tx_hash.clone(),
                satisfied,
            ))
            .await?;

        account.owed = Some(remaining);
        account.transferred += amount;
        account.transient_failures = 0;
        account.invalidate();

        Ok(Outcome::Transferred {
            amount,
            tx_hash,
            satisfied,
        })
    }

    fn reject(&self, account: &Account, reason: String) -> Outcome {
        warn!("Transfer to {} rejected: {}", account.address, reason);
        Outcome::Failed(format!("rejected: {}", reason))
    }

    fn transient(&self, account: &mut Account, reason: String) -> Outcome {
        account.transient_failures += 1;
        account.invalidate();
        let attempts = account.transient_failures;

        if attempts >= self.settings.max_transient_attempts {
            warn!(
                "Giving up on {} after {} transient failures: {}",
                account.address, attempts, reason
            );
            return Outcome::Failed(match &account.in_flight {
                Some(t) => format!(
                    "transfer of {} with nonce {} still unconfirmed after {} attempts: {}",
                    t.amount, t.nonce, attempts, reason
                ),
                None => format!("gave up after {} transient failures: {}", attempts, reason),
            });
        }

        warn!(
            "Transient failure for {} ({}/{}): {}",
            account.address, attempts, self.settings.max_transient_attempts, reason
        );
        Outcome::Transient(reason)
    }
}

/// What an unconfirmed transfer turned out to be
#[derive(Debug)]
enum Settlement {
    Landed(String),
    Reverted(String),
    NotLanded,
    Unknown(String),
}
