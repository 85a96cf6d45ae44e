//! Final per-account report

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::migration::types::{
    amount_string, format_units, Account, Amount, RetireReason, TransferRecord,
};

/// Where an account ended up
#[derive(Debug, Clone, Serialize)]
pub struct AccountReport {
    pub address: String,
    /// `None` when the run stopped with the account still queued
    pub outcome: Option<RetireReason>,
    #[serde(with = "amount_string")]
    pub transferred: Amount,
    #[serde(with = "amount_string::option")]
    pub remaining: Option<Amount>,
}

impl AccountReport {
    pub fn retired(account: &Account, reason: RetireReason) -> Self {
        Self {
            address: account.address.clone(),
            outcome: Some(reason),
            transferred: account.transferred,
            remaining: account.owed,
        }
    }

    pub fn pending(account: &Account) -> Self {
        Self {
            address: account.address.clone(),
            outcome: None,
            transferred: account.transferred,
            remaining: account.owed,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, Some(RetireReason::Failed(_)))
    }
}

/// Summary of one migration run
#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub interrupted: bool,
    pub rounds: u64,
    pub accounts: Vec<AccountReport>,
    pub records: Vec<TransferRecord>,
    #[serde(skip)]
    pub token_decimals: u32,
}

impl MigrationReport {
    pub fn count(&self, reason: &RetireReason) -> usize {
        self.accounts
            .iter()
            .filter(|a| a.outcome.as_ref() == Some(reason))
            .count()
    }

    pub fn failed(&self) -> impl Iterator<Item = &AccountReport> {
        self.accounts.iter().filter(|a| a.is_failed())
    }

    pub fn pending(&self) -> impl Iterator<Item = &AccountReport> {
        self.accounts.iter().filter(|a| a.outcome.is_none())
    }

    pub fn total_transferred(&self) -> Amount {
        self.records.iter().map(|r| r.amount).sum()
    }

    /// Every account satisfied, below threshold or (dry run) planned
    pub fn is_complete(&self) -> bool {
        !self.interrupted && self.failed().next().is_none() && self.pending().next().is_none()
    }

    /// Process exit code: 0 complete, 2 incomplete
    pub fn exit_code(&self) -> i32 {
        if self.is_complete() {
            0
        } else {
            2
        }
    }
}

impl std::fmt::Display for MigrationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let planned = self
            .accounts
            .iter()
            .filter(|a| matches!(a.outcome, Some(RetireReason::Planned(_))))
            .count();

        writeln!(f, "Migration run {}", self.run_id)?;
        if self.dry_run {
            writeln!(f, "  mode:            DRY RUN")?;
        }
        writeln!(
            f,
            "  duration:        {}s over {} rounds",
            (self.finished_at - self.started_at).num_seconds(),
            self.rounds
        )?;
        writeln!(f, "  accounts:        {}", self.accounts.len())?;
        writeln!(
            f,
            "  satisfied:       {}",
            self.count(&RetireReason::Satisfied)
        )?;
        writeln!(
            f,
            "  below threshold: {}",
            self.count(&RetireReason::BelowThreshold)
        )?;
        if planned > 0 {
            writeln!(f, "  planned:         {}", planned)?;
        }
        writeln!(f, "  failed:          {}", self.failed().count())?;
        writeln!(f, "  pending:         {}", self.pending().count())?;
        writeln!(
            f,
            "  transferred:     {} in {} transactions",
            format_units(self.total_transferred(), self.token_decimals),
            self.records.len()
        )?;

        if self.interrupted {
            writeln!(f, "  INTERRUPTED: rerun to continue, progress is read from the ledgers")?;
        }

        for account in self.failed() {
            if let Some(reason) = &account.outcome {
                writeln!(f, "  ✗ {} {}", account.address, reason)?;
            }
        }
        for account in self.pending() {
            writeln!(
                f,
                "  … {} pending ({} owed)",
                account.address,
                account
                    .remaining
                    .map(|r| format_units(r, self.token_decimals))
                    .unwrap_or_else(|| "unresolved".to_string())
            )?;
        }

        Ok(())
    }
}
