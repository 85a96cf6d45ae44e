//! Priority work queue
//!
//! Accounts are ordered by descending owed amount, ties broken by their
//! position in the membership snapshot. Unresolved accounts sort by their
//! scaled earnings, which bound what they can be owed from above, so the
//! head key also bounds every entry behind it.
//!
//! Only the control loop touches the queue. Workers receive owned accounts
//! and hand them back as outcomes.

use std::cmp::Reverse;
use std::collections::VecDeque;

use tracing::debug;

use crate::migration::resolver::AmountResolver;
use crate::migration::types::{Account, Amount, RetireReason};

pub struct MigrationScheduler {
    queue: VecDeque<Account>,
    retired: Vec<(Account, RetireReason)>,
    resolver: AmountResolver,
    dust_threshold: Amount,
}

impl MigrationScheduler {
    pub fn new(accounts: Vec<Account>, resolver: AmountResolver, dust_threshold: Amount) -> Self {
        let mut scheduler = Self {
            queue: accounts.into(),
            retired: Vec::new(),
            resolver,
            dust_threshold,
        };
        scheduler.resort();
        scheduler
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Re-sort the whole queue to absorb newly resolved amounts
    pub fn resort(&mut self) {
        let resolver = &self.resolver;
        self.queue
            .make_contiguous()
            .sort_by_key(|a| (Reverse(resolver.sort_key(a)), a.seq));
    }

    /// Sort key of the queue head
    pub fn head_owed(&self) -> Option<Amount> {
        self.queue.front().map(|a| self.resolver.sort_key(a))
    }

    /// Whether the queue has nothing left worth migrating
    pub fn is_exhausted(&self) -> bool {
        match self.head_owed() {
            None => true,
            Some(owed) => owed <= self.dust_threshold,
        }
    }

    /// Pop up to `n` accounts from the front
    pub fn next_batch(&mut self, n: usize) -> Vec<Account> {
        let take = n.min(self.queue.len());
        self.queue.drain(..take).collect()
    }

    /// Return an account to the queue, it is ordered on the next `resort`
    pub fn reinsert(&mut self, account: Account) {
        self.queue.push_back(account);
    }

    /// Remove an account from further rounds
    pub fn retire(&mut self, account: Account, reason: RetireReason) {
        debug!("Retiring {}: {}", account.address, reason);
        self.retired.push((account, reason));
    }

    /// Retire everything still queued as below the dust threshold
    ///
    /// Only valid once `is_exhausted` holds.
    pub fn retire_remaining(&mut self) -> usize {
        let remaining: Vec<Account> = self.queue.drain(..).collect();
        let count = remaining.len();
        for account in remaining {
            self.retire(account, RetireReason::BelowThreshold);
        }
        count
    }

    /// Sum of sort keys still queued
    pub fn outstanding(&self) -> Amount {
        self.queue.iter().map(|a| self.resolver.sort_key(a)).sum()
    }

    pub fn retired(&self) -> &[(Account, RetireReason)] {
        &self.retired
    }

    /// Consume into (retired, still queued)
    pub fn into_parts(self) -> (Vec<(Account, RetireReason)>, Vec<Account>) {
        (self.retired, self.queue.into())
    }
}
