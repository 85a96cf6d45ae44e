//! Ledger collaborators
//!
//! Everything the migration engine knows about the outside world goes through
//! two traits:
//!
//! ```text
//! MembershipSource  → who is owed (paginated earnings snapshot)
//! Ledger            → balances, withdrawn/migrated state, tx submission
//! ```
//!
//! Both are treated as eventually consistent. Every call may fail with a
//! transient error (`Error::is_retryable`) or a chain rejection
//! (`Error::is_rejection`).

pub mod gateway;
pub mod membership;

#[cfg(test)]
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::migration::types::{amount_string, Amount, Chain, LedgerSide};

pub use gateway::GatewayLedger;
pub use membership::{HttpMembershipSource, MemberRecord, MembershipSource};

/// A state-changing call submitted by the operating wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TxRequest {
    /// Credit `amount` to `to` inside the new ledger
    Transfer {
        to: String,
        #[serde(with = "amount_string")]
        amount: Amount,
    },
    /// Approve the bridge and relay `amount` from primary to secondary
    ApproveAndRelay {
        #[serde(with = "amount_string")]
        amount: Amount,
    },
    /// Allow `spender` to pull up to `amount` from the operating wallet
    Approve {
        spender: String,
        #[serde(with = "amount_string")]
        amount: Amount,
    },
    /// Register members on the new ledger
    AddMembers { addresses: Vec<String> },
}

impl TxRequest {
    /// Network this request must be sent to
    pub fn chain(&self) -> Chain {
        match self {
            TxRequest::ApproveAndRelay { .. } => Chain::Primary,
            TxRequest::Transfer { .. } | TxRequest::Approve { .. } | TxRequest::AddMembers { .. } => {
                Chain::Secondary
            }
        }
    }
}

/// Outcome of an included transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "reason")]
pub enum ReceiptStatus {
    Success,
    Reverted(String),
}

/// Inclusion receipt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub tx_hash: String,
    pub block: u64,
    #[serde(flatten)]
    pub status: ReceiptStatus,
}

impl Receipt {
    pub fn is_success(&self) -> bool {
        self.status == ReceiptStatus::Success
    }
}

/// Membership state of an address on the new ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    /// Never added
    None,
    Active,
    Inactive,
}

/// Ledger read/write collaborator
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Transferable-asset balance of `holder` on `chain`
    async fn token_balance(&self, chain: Chain, holder: &str) -> Result<Amount>;

    /// Amount `account` has withdrawn from the legacy ledger
    async fn withdrawn(&self, account: &str) -> Result<Amount>;

    /// Amount credited to `account` on the new ledger, 0 for non-members
    async fn migrated(&self, account: &str) -> Result<Amount>;

    /// Sum of everything credited on the new ledger so far
    async fn total_migrated(&self) -> Result<Amount>;

    /// Membership state of `account` on the new ledger
    async fn member_status(&self, account: &str) -> Result<MemberStatus>;

    /// Token contract address used by a ledger
    async fn token_address(&self, side: LedgerSide) -> Result<String>;

    /// Contract bytecode at `address`, empty when nothing is deployed
    async fn code_at(&self, chain: Chain, address: &str) -> Result<Vec<u8>>;

    /// Next sequence number for `identity` on `chain`, counting pending transactions
    async fn transaction_count(&self, chain: Chain, identity: &str) -> Result<u64>;

    /// Broadcast `request` with the given sequence number, returning its hash
    async fn submit(&self, nonce: u64, request: &TxRequest) -> Result<String>;

    /// Wait until `tx_hash` is included and return its receipt
    async fn wait_for_receipt(&self, chain: Chain, tx_hash: &str) -> Result<Receipt>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_chain_routing() {
        assert_eq!(
            TxRequest::ApproveAndRelay { amount: 1 }.chain(),
            Chain::Primary
        );
        assert_eq!(
            TxRequest::Transfer {
                to: "0x1".into(),
                amount: 1
            }
            .chain(),
            Chain::Secondary
        );
    }

    #[test]
    fn test_receipt_deserialize() {
        let ok: Receipt =
            serde_json::from_str(r#"{"txHash":"0xaa","block":12,"status":"success"}"#).unwrap();
        assert!(ok.is_success());

        let reverted: Receipt = serde_json::from_str(
            r#"{"txHash":"0xbb","block":13,"status":"reverted","reason":"not eligible"}"#,
        )
        .unwrap();
        assert_eq!(
            reverted.status,
            ReceiptStatus::Reverted("not eligible".to_string())
        );
    }

    #[test]
    fn test_request_serializes_amount_as_string() {
        let json = serde_json::to_string(&TxRequest::Transfer {
            to: "0x1".into(),
            amount: 5,
        })
        .unwrap();
        assert_eq!(json, r#"{"kind":"transfer","to":"0x1","amount":"5"}"#);
    }
}
