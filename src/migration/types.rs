//! Core types for the migration engine
//!
//! Defines accounts, transfer records, funding snapshots and the amount
//! helpers shared by every external surface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Token amount in base units
pub type Amount = u128;

/// Which network a call or transaction targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Chain {
    /// Network of the legacy ledger and the bridge entrance
    Primary,
    /// Fee-cheap network where the new ledger disburses
    Secondary,
}

impl std::fmt::Display for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Chain::Primary => write!(f, "primary"),
            Chain::Secondary => write!(f, "secondary"),
        }
    }
}

/// Which ledger contract a read targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerSide {
    Legacy,
    New,
}

impl std::fmt::Display for LedgerSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerSide::Legacy => write!(f, "legacy"),
            LedgerSide::New => write!(f, "new"),
        }
    }
}

/// An account being migrated
///
/// `total_earnings` comes from the membership source and is never rewritten.
/// The ledger-derived fields are `None` until the account is first resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    /// Checksum-agnostic hex address, unique key
    pub address: String,

    /// Total earnings recorded by the membership source
    pub total_earnings: Amount,

    /// Amount already withdrawn from the legacy ledger
    pub withdrawn_on_old: Option<Amount>,

    /// Amount already credited on the new ledger
    pub migrated_on_new: Option<Amount>,

    /// Last computed owed amount
    pub owed: Option<Amount>,

    /// Round in which `owed` was last read from the ledgers
    pub resolved_round: Option<u64>,

    /// Position in the initial membership snapshot, used to break ties
    pub seq: u64,

    /// Consecutive transient failures
    pub transient_failures: u32,

    /// Amount transferred to this account during this run
    pub transferred: Amount,

    /// Transfer sent without a confirmed outcome, settled before any new one
    pub in_flight: Option<InFlightTransfer>,
}

/// A transfer that may have reached the chain but was never confirmed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightTransfer {
    pub nonce: u64,
    /// Known once the gateway acknowledged the broadcast
    pub tx_hash: Option<String>,
    pub amount: Amount,
    /// `migrated_on_new` as read before sending
    pub migrated_before: Amount,
}

impl Account {
    pub fn new(address: impl Into<String>, total_earnings: Amount, seq: u64) -> Self {
        Self {
            address: address.into(),
            total_earnings,
            withdrawn_on_old: None,
            migrated_on_new: None,
            owed: None,
            resolved_round: None,
            seq,
            transient_failures: 0,
            transferred: 0,
            in_flight: None,
        }
    }

    /// Whether the owed amount has ever been read from the ledgers
    pub fn is_resolved(&self) -> bool {
        self.owed.is_some()
    }

    /// Drop the per-round cache so the next resolution re-reads both ledgers
    pub fn invalidate(&mut self) {
        self.resolved_round = None;
    }
}

/// Immutable audit entry for one completed transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    /// Unique record ID
    pub id: Uuid,

    /// Migration run that produced this record
    pub run_id: Uuid,

    /// Recipient account
    pub account: String,

    /// Amount transferred
    #[serde(with = "amount_string")]
    pub amount: Amount,

    /// Transaction hash of the inclusion receipt
    pub tx_hash: String,

    /// Whether this transfer brought the account below the dust threshold
    pub satisfied: bool,

    /// When the receipt was observed
    pub timestamp: DateTime<Utc>,
}

impl TransferRecord {
    pub fn new(
        run_id: Uuid,
        account: &str,
        amount: Amount,
        tx_hash: String,
        satisfied: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            account: account.to_string(),
            amount,
            tx_hash,
            satisfied,
            timestamp: Utc::now(),
        }
    }
}

/// Snapshot of required vs. observed operating-wallet balance on the secondary chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FundingState {
    pub required: Amount,
    pub available: Amount,
}

impl FundingState {
    pub fn is_funded(&self) -> bool {
        self.available >= self.required
    }

    pub fn deficit(&self) -> Amount {
        self.required.saturating_sub(self.available)
    }
}

/// Why an account left the work queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "reason")]
pub enum RetireReason {
    /// Owed amount transferred down to the dust threshold
    Satisfied,
    /// Owed amount was at or below the dust threshold
    BelowThreshold,
    /// Excluded after a contract-level rejection or repeated transient errors
    Failed(String),
    /// Dry run: the transfer that would have been submitted
    Planned(#[serde(with = "amount_string")] Amount),
}

impl std::fmt::Display for RetireReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetireReason::Satisfied => write!(f, "satisfied"),
            RetireReason::BelowThreshold => write!(f, "below threshold"),
            RetireReason::Failed(reason) => write!(f, "failed: {}", reason),
            RetireReason::Planned(amount) => write!(f, "would transfer {}", amount),
        }
    }
}

/// Parse a decimal amount string
pub fn parse_amount(s: &str) -> Option<Amount> {
    let s = s.trim();
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

/// Render an amount with a decimal point, trimming trailing zeros
pub fn format_units(amount: Amount, decimals: u32) -> String {
    if decimals == 0 {
        return amount.to_string();
    }
    let unit = 10u128.pow(decimals);
    let whole = amount / unit;
    let frac = amount % unit;
    if frac == 0 {
        return whole.to_string();
    }
    let frac = format!("{:0width$}", frac, width = decimals as usize);
    format!("{}.{}", whole, frac.trim_end_matches('0'))
}

/// Serde adapter: amounts travel as decimal strings, numbers are accepted on input
pub mod amount_string {
    use serde::{de, Deserialize, Deserializer, Serializer};

    use super::{parse_amount, Amount};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Num(u64),
    }

    pub fn serialize<S: Serializer>(amount: &Amount, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&amount.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Amount, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Str(s) => parse_amount(&s)
                .ok_or_else(|| de::Error::custom(format!("invalid amount: {:?}", s))),
            Raw::Num(n) => Ok(n as Amount),
        }
    }

    /// Same adapter for optional amounts
    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};

        use super::super::Amount;

        pub fn serialize<S: Serializer>(
            amount: &Option<Amount>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match amount {
                Some(a) => serializer.serialize_some(&a.to_string()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Amount>, D::Error> {
            #[derive(Deserialize)]
            struct Wrapper(#[serde(with = "super")] Amount);

            let wrapped: Option<Wrapper> = Option::deserialize(deserializer)?;
            Ok(wrapped.map(|Wrapper(a)| a))
        }
    }
}
