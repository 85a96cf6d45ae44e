//! Error types for the migrator

use thiserror::Error;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the migrator
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // RPC / gateway errors (transient)
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("RPC timeout after {0}ms")]
    RpcTimeout(u64),

    #[error("RPC connection failed: {0}")]
    RpcConnection(String),

    #[error("Nonce {nonce} rejected as stale by chain")]
    NonceStale { nonce: u64 },

    #[error("Transaction send failed: {0}")]
    TransactionSend(String),

    // The request may have reached the chain; resending could pay twice
    #[error("Outcome of submission with nonce {nonce} is unknown: {reason}")]
    SubmitUnknown { nonce: u64, reason: String },

    // Per-account rejection
    #[error("Transaction rejected by chain: {0}")]
    Rejected(String),

    // Data-consistency fatal errors
    #[error(
        "Negative owed amount for {address}: earnings {earnings} < withdrawn {withdrawn} + migrated {migrated}"
    )]
    NegativeOwed {
        address: String,
        earnings: u128,
        withdrawn: u128,
        migrated: u128,
    },

    #[error("Different tokens found! Legacy ledger uses {old}, new ledger uses {new}")]
    TokenMismatch { old: String, new: String },

    #[error("Malformed member record: {0}")]
    MalformedMember(String),

    #[error("Account {0} already has a settling transfer record in this run")]
    DuplicateSettlement(String),

    #[error("No contract code at {address} on {chain}")]
    MissingContract { chain: String, address: String },

    // Funding fatal errors
    #[error("Insufficient funds at source: {available} available, {required} required")]
    InsufficientSourceFunds { available: u128, required: u128 },

    #[error(
        "Bridge timeout: {deficit} not observed on secondary chain after {waited_secs}s, funds may be stuck in the bridge"
    )]
    BridgeTimeout { deficit: u128, waited_secs: u64 },

    #[error("Bridge relay failed: {0}")]
    BridgeRelay(String),

    #[error("Allowance approval failed: {0}")]
    Approval(String),

    // Membership errors
    #[error("Membership source error: {0}")]
    Membership(String),

    #[error("Membership sync failed: {0}")]
    MembershipSync(String),

    // Progress ledger errors
    #[error("Progress ledger persistence failed: {0}")]
    Persistence(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable (transient)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Rpc(_)
                | Error::RpcTimeout(_)
                | Error::RpcConnection(_)
                | Error::NonceStale { .. }
                | Error::TransactionSend(_)
        )
    }

    /// Check if a transaction may have been broadcast despite the error
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Error::SubmitUnknown { .. })
    }

    /// Check if this error is a contract-level rejection scoped to one account
    pub fn is_rejection(&self) -> bool {
        matches!(self, Error::Rejected(_))
    }

    /// Check if this error means the source data cannot be trusted
    pub fn is_data_consistency(&self) -> bool {
        matches!(
            self,
            Error::NegativeOwed { .. }
                | Error::TokenMismatch { .. }
                | Error::MalformedMember(_)
                | Error::DuplicateSettlement(_)
                | Error::MissingContract { .. }
        )
    }

    /// Check if this error aborts the run before disbursement
    pub fn is_funding_fatal(&self) -> bool {
        matches!(
            self,
            Error::InsufficientSourceFunds { .. }
                | Error::BridgeTimeout { .. }
                | Error::BridgeRelay(_)
                | Error::Approval(_)
        )
    }
}

// Conversion from reqwest errors
impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Rpc(format!("request timed out: {}", e))
        } else if e.is_connect() {
            Error::RpcConnection(e.to_string())
        } else if e.is_decode() {
            Error::Deserialization(e.to_string())
        } else {
            Error::Rpc(e.to_string())
        }
    }
}

// Conversion from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Conversion from I/O errors
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}
