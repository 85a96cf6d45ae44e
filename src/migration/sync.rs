//! Membership sync on the new ledger
//!
//! Accounts that are not active on the new ledger are added in batches.
//! Already-active accounts must be left out: one of them in a batch reverts
//! the whole batch.

use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::ledger::{Ledger, MemberStatus, ReceiptStatus, TxRequest};
use crate::migration::nonce::NonceSequencer;
use crate::migration::types::{Account, Chain};

/// Concurrent membership reads while scanning
const STATUS_READ_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub already_active: usize,
    pub added: usize,
    pub batches: usize,
}

pub struct MembershipSync {
    ledger: Arc<dyn Ledger>,
    sequencer: Arc<NonceSequencer>,
    batch_size: usize,
    dry_run: bool,
}

impl MembershipSync {
    pub fn new(ledger: Arc<dyn Ledger>, sequencer: Arc<NonceSequencer>, batch_size: usize) -> Self {
        Self {
            ledger,
            sequencer,
            batch_size: batch_size.max(1),
            dry_run: false,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Add every account not yet active on the new ledger
    pub async fn sync(&self, accounts: &[Account]) -> Result<SyncSummary> {
        let statuses: Vec<(String, MemberStatus)> = stream::iter(accounts)
            .map(|account| async move {
                let status = self.ledger.member_status(&account.address).await?;
                Ok::<_, Error>((account.address.clone(), status))
            })
            .buffered(STATUS_READ_CONCURRENCY)
            .try_collect()
            .await?;

        let mut summary = SyncSummary::default();
        let mut pending = Vec::new();
        for (address, status) in statuses {
            if status == MemberStatus::Active {
                summary.already_active += 1;
            } else {
                pending.push(address);
            }
        }

        info!(
            "Membership sync: {} already active, {} to add",
            summary.already_active,
            pending.len()
        );

        for batch in pending.chunks(self.batch_size) {
            if self.dry_run {
                warn!("[DRY RUN] Would add {} members", batch.len());
                summary.batches += 1;
                continue;
            }

            let submitted = self
                .sequencer
                .submit(&TxRequest::AddMembers {
                    addresses: batch.to_vec(),
                })
                .await
                .map_err(|e| Error::MembershipSync(e.to_string()))?;

            let receipt = self
                .ledger
                .wait_for_receipt(Chain::Secondary, &submitted.tx_hash)
                .await
                .map_err(|e| Error::MembershipSync(e.to_string()))?;

            if let ReceiptStatus::Reverted(reason) = receipt.status {
                return Err(Error::MembershipSync(format!(
                    "batch of {} starting at {} reverted: {}",
                    batch.len(),
                    batch[0],
                    reason
                )));
            }

            debug!("Added {} members in {}", batch.len(), receipt.tx_hash);
            summary.added += batch.len();
            summary.batches += 1;
        }

        Ok(summary)
    }
}
