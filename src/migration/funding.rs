//! Bridge funding
//!
//! Before disbursing, the operating wallet on the secondary chain must hold
//! the full required amount. Any shortfall is relayed once from the primary
//! chain and then observed by polling; arrival is never assumed.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt, TryStreamExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::ledger::{Ledger, ReceiptStatus, TxRequest};
use crate::migration::nonce::NonceSequencer;
use crate::migration::resolver::AmountResolver;
use crate::migration::types::{Account, Amount, Chain, FundingState};

const MIGRATED_READ_CONCURRENCY: usize = 8;

/// Funding needed to pay out `accounts`: their scaled earnings minus what the
/// new ledger already credited to those same accounts
pub async fn required_total(
    ledger: &dyn Ledger,
    accounts: &[Account],
    resolver: &AmountResolver,
) -> Result<Amount> {
    let migrated: Vec<Amount> = stream::iter(accounts)
        .map(|account| ledger.migrated(&account.address))
        .buffered(MIGRATED_READ_CONCURRENCY)
        .try_collect()
        .await?;

    let earnings: Amount = accounts.iter().map(|a| resolver.scaled_earnings(a)).sum();
    let credited: Amount = migrated.iter().sum();
    debug!(
        "Work set of {} accounts: {} scaled earnings, {} already credited",
        accounts.len(),
        earnings,
        credited
    );
    Ok(earnings.saturating_sub(credited))
}

/// Bounded poll settings for bridge arrival
#[derive(Debug, Clone, Copy)]
pub struct BridgePoll {
    pub interval: Duration,
    pub timeout: Duration,
}

pub struct FundingCoordinator {
    ledger: Arc<dyn Ledger>,
    primary: Arc<NonceSequencer>,
    secondary: Arc<NonceSequencer>,
    operator: String,
    spender: String,
    poll: BridgePoll,
    dry_run: bool,
    cancel: CancellationToken,
}

impl FundingCoordinator {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        primary: Arc<NonceSequencer>,
        secondary: Arc<NonceSequencer>,
        operator: impl Into<String>,
        spender: impl Into<String>,
        poll: BridgePoll,
    ) -> Self {
        Self {
            ledger,
            primary,
            secondary,
            operator: operator.into(),
            spender: spender.into(),
            poll,
            dry_run: false,
            cancel: CancellationToken::new(),
        }
    }

    /// Report deficits without relaying or approving anything
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Stop waiting for the bridge when `cancel` fires
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Make sure the secondary balance covers `required`, relaying the deficit if not
    ///
    /// Idempotent: a funded wallet causes no bridge activity.
    pub async fn ensure_funded(&self, required: Amount) -> Result<FundingState> {
        let available = self
            .ledger
            .token_balance(Chain::Secondary, &self.operator)
            .await?;
        let state = FundingState {
            required,
            available,
        };

        if state.is_funded() {
            info!(
                "Secondary balance {} covers required {}, no bridging needed",
                available, required
            );
            return Ok(state);
        }

        let deficit = state.deficit();
        let source = self
            .ledger
            .token_balance(Chain::Primary, &self.operator)
            .await?;
        if source < deficit {
            return Err(Error::InsufficientSourceFunds {
                available: source,
                required: deficit,
            });
        }

        if self.dry_run {
            warn!(
                "[DRY RUN] Would relay {} across the bridge (source balance {})",
                deficit, source
            );
            return Ok(state);
        }

        info!("Relaying {} from primary to secondary", deficit);
        self.relay(deficit).await?;

        let target = available + deficit;
        let observed = self.await_arrival(target, deficit).await?;
        Ok(FundingState {
            required,
            available: observed,
        })
    }

    async fn relay(&self, deficit: Amount) -> Result<()> {
        let submitted = self
            .primary
            .submit(&TxRequest::ApproveAndRelay { amount: deficit })
            .await
            .map_err(|e| Error::BridgeRelay(e.to_string()))?;

        let receipt = self
            .ledger
            .wait_for_receipt(Chain::Primary, &submitted.tx_hash)
            .await
            .map_err(|e| {
                Error::BridgeRelay(format!(
                    "relay {} not confirmed: {}",
                    submitted.tx_hash, e
                ))
            })?;

        match receipt.status {
            ReceiptStatus::Success => {
                info!("Relay included in block {} ({})", receipt.block, receipt.tx_hash);
                Ok(())
            }
            ReceiptStatus::Reverted(reason) => Err(Error::BridgeRelay(format!(
                "relay {} reverted: {}",
                receipt.tx_hash, reason
            ))),
        }
    }

    /// Poll the secondary balance until it reaches `target` or the timeout elapses
    async fn await_arrival(&self, target: Amount, deficit: Amount) -> Result<Amount> {
        let started = Instant::now();
        let deadline = started + self.poll.timeout;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    warn!("Interrupted while waiting for bridged funds");
                    return Err(Error::BridgeTimeout {
                        deficit,
                        waited_secs: started.elapsed().as_secs(),
                    });
                }
                _ = tokio::time::sleep(self.poll.interval) => {}
            }

            match self
                .ledger
                .token_balance(Chain::Secondary, &self.operator)
                .await
            {
                Ok(balance) if balance >= target => {
                    info!(
                        "Bridged funds arrived after {}s, secondary balance {}",
                        started.elapsed().as_secs(),
                        balance
                    );
                    return Ok(balance);
                }
                Ok(balance) => debug!("Waiting for bridge: {} / {}", balance, target),
                Err(e) if e.is_retryable() => warn!("Balance poll failed: {}", e),
                Err(e) => return Err(e),
            }

            if Instant::now() >= deadline {
                return Err(Error::BridgeTimeout {
                    deficit,
                    waited_secs: started.elapsed().as_secs(),
                });
            }
        }
    }

    /// Allow the new ledger to pull `amount` from the operating wallet
    pub async fn ensure_allowance(&self, amount: Amount) -> Result<()> {
        if amount == 0 {
            return Ok(());
        }
        if self.dry_run {
            warn!("[DRY RUN] Would approve {} for {}", amount, self.spender);
            return Ok(());
        }

        let submitted = self
            .secondary
            .submit(&TxRequest::Approve {
                spender: self.spender.clone(),
                amount,
            })
            .await
            .map_err(|e| Error::Approval(e.to_string()))?;

        let receipt = self
            .ledger
            .wait_for_receipt(Chain::Secondary, &submitted.tx_hash)
            .await
            .map_err(|e| Error::Approval(e.to_string()))?;

        match receipt.status {
            ReceiptStatus::Success => {
                info!("Approved {} for {}", amount, self.spender);
                Ok(())
            }
            ReceiptStatus::Reverted(reason) => Err(Error::Approval(reason)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::memory::MemoryLedger;

    const OPERATOR: &str = "0x9999999999999999999999999999999999999999";
    const NEW_LEDGER: &str = "0x2222222222222222222222222222222222222222";

    fn coordinator(ledger: Arc<MemoryLedger>, timeout_ms: u64) -> FundingCoordinator {
        FundingCoordinator::new(
            ledger.clone(),
            Arc::new(NonceSequencer::new(ledger.clone(), Chain::Primary, OPERATOR)),
            Arc::new(NonceSequencer::new(ledger, Chain::Secondary, OPERATOR)),
            OPERATOR,
            NEW_LEDGER,
            BridgePoll {
                interval: Duration::from_millis(5),
                timeout: Duration::from_millis(timeout_ms),
            },
        )
    }

    #[tokio::test]
    async fn test_required_total_counts_only_work_set() {
        let ledger = Arc::new(MemoryLedger::new(OPERATOR));
        let resolver = AmountResolver::new(ledger.clone(), 10);
        let accounts = vec![Account::new("a", 1_000, 0), Account::new("b", 505, 1)];
        assert_eq!(
            required_total(ledger.as_ref(), &accounts, &resolver).await.unwrap(),
            150
        );

        ledger.set_migrated("a", 100);
        assert_eq!(
            required_total(ledger.as_ref(), &accounts, &resolver).await.unwrap(),
            50
        );

        // Credit held by a member outside the work set does not fund anyone in it
        ledger.set_migrated("c", 500);
        assert_eq!(
            required_total(ledger.as_ref(), &accounts, &resolver).await.unwrap(),
            50
        );
    }

    #[tokio::test]
    async fn test_funded_wallet_skips_bridge() {
        let ledger = Arc::new(MemoryLedger::new(OPERATOR));
        ledger.set_balance(Chain::Secondary, OPERATOR, 100);

        let state = coordinator(ledger.clone(), 100)
            .ensure_funded(100)
            .await
            .unwrap();
        assert!(state.is_funded());
        assert_eq!(ledger.relay_count(), 0);
    }

    #[tokio::test]
    async fn test_insufficient_source_is_fatal_without_relay() {
        let ledger = Arc::new(MemoryLedger::new(OPERATOR));
        ledger.set_balance(Chain::Secondary, OPERATOR, 70);
        ledger.set_balance(Chain::Primary, OPERATOR, 20);

        let err = coordinator(ledger.clone(), 100)
            .ensure_funded(100)
            .await
            .unwrap_err();
        assert!(err.is_funding_fatal());
        assert!(matches!(
            err,
            Error::InsufficientSourceFunds {
                available: 20,
                required: 30
            }
        ));
        assert_eq!(ledger.relay_count(), 0);
        assert!(ledger.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_relays_exact_deficit_and_waits() {
        let ledger = Arc::new(MemoryLedger::new(OPERATOR));
        ledger.set_balance(Chain::Secondary, OPERATOR, 70);
        ledger.set_balance(Chain::Primary, OPERATOR, 500);
        ledger.set_bridge_delay(Some(3));

        let state = coordinator(ledger.clone(), 2_000)
            .ensure_funded(100)
            .await
            .unwrap();
        assert!(state.is_funded());
        assert_eq!(state.available, 100);
        assert_eq!(ledger.relay_count(), 1);
        assert_eq!(ledger.balance(Chain::Primary, OPERATOR), 470);
        assert!(matches!(
            ledger.submitted()[0].1,
            TxRequest::ApproveAndRelay { amount: 30 }
        ));
    }

    #[tokio::test]
    async fn test_bridge_timeout_is_fatal() {
        let ledger = Arc::new(MemoryLedger::new(OPERATOR));
        ledger.set_balance(Chain::Primary, OPERATOR, 500);
        ledger.set_bridge_delay(None);

        let err = coordinator(ledger.clone(), 30)
            .ensure_funded(50)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BridgeTimeout { deficit: 50, .. }));
        assert_eq!(ledger.relay_count(), 1);
    }

    #[tokio::test]
    async fn test_dry_run_reports_only() {
        let ledger = Arc::new(MemoryLedger::new(OPERATOR));
        ledger.set_balance(Chain::Primary, OPERATOR, 500);

        let funding = coordinator(ledger.clone(), 100).dry_run(true);
        let state = funding.ensure_funded(50).await.unwrap();
        assert_eq!(state.deficit(), 50);
        funding.ensure_allowance(50).await.unwrap();
        assert!(ledger.submitted().is_empty());
    }

    #[tokio::test]
    async fn test_ensure_allowance() {
        let ledger = Arc::new(MemoryLedger::new(OPERATOR));
        coordinator(ledger.clone(), 100)
            .ensure_allowance(250)
            .await
            .unwrap();
        assert_eq!(ledger.allowance(), 250);
    }
}
