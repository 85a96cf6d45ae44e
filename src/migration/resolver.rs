//! Owed-amount resolution
//!
//! `owed = total_earnings / divisor - withdrawn_on_old - migrated_on_new`
//!
//! Both ledger reads happen at most once per account per round; later calls
//! in the same round return the cached value.

use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, Result};
use crate::ledger::Ledger;
use crate::migration::types::{Account, Amount};

/// Computes what each account is still owed
#[derive(Clone)]
pub struct AmountResolver {
    ledger: Arc<dyn Ledger>,
    divisor: Amount,
}

impl AmountResolver {
    pub fn new(ledger: Arc<dyn Ledger>, divisor: u64) -> Self {
        Self {
            ledger,
            divisor: Amount::from(divisor.max(1)),
        }
    }

    /// Earnings after applying the test-run divisor
    pub fn scaled_earnings(&self, account: &Account) -> Amount {
        account.total_earnings / self.divisor
    }

    /// Upper bound on what `account` can be owed, used to order unresolved accounts
    pub fn sort_key(&self, account: &Account) -> Amount {
        account
            .owed
            .unwrap_or_else(|| self.scaled_earnings(account))
    }

    /// Resolve the owed amount for `round`, reading the ledgers if not cached
    pub async fn resolve(&self, account: &mut Account, round: u64) -> Result<Amount> {
        if account.resolved_round == Some(round) {
            if let Some(owed) = account.owed {
                return Ok(owed);
            }
        }

        let (withdrawn, migrated) = tokio::try_join!(
            self.ledger.withdrawn(&account.address),
            self.ledger.migrated(&account.address)
        )?;

        let earnings = self.scaled_earnings(account);
        let owed = owed_amount(&account.address, earnings, withdrawn, migrated)?;

        debug!(
            "Resolved {}: earnings={} withdrawn={} migrated={} owed={}",
            account.address, earnings, withdrawn, migrated, owed
        );

        account.withdrawn_on_old = Some(withdrawn);
        account.migrated_on_new = Some(migrated);
        account.owed = Some(owed);
        account.resolved_round = Some(round);

        Ok(owed)
    }
}

/// `earnings - withdrawn - migrated`, a negative result is a data-consistency fault
pub fn owed_amount(
    address: &str,
    earnings: Amount,
    withdrawn: Amount,
    migrated: Amount,
) -> Result<Amount> {
    withdrawn
        .checked_add(migrated)
        .and_then(|paid| earnings.checked_sub(paid))
        .ok_or_else(|| Error::NegativeOwed {
            address: address.to_string(),
            earnings,
            withdrawn,
            migrated,
        })
}
