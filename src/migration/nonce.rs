//! Per-chain sequence numbers for the operating wallet
//!
//! One sequencer exists per (chain, signing identity). The cursor is seeded
//! lazily from the chain and only ever moves forward: a slot is consumed as
//! soon as it is handed out, whether or not the broadcast succeeds.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::ledger::{Ledger, TxRequest};
use crate::migration::types::Chain;

/// A broadcast transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submitted {
    pub nonce: u64,
    pub tx_hash: String,
}

/// Serializes submissions from one signing identity on one chain
pub struct NonceSequencer {
    ledger: Arc<dyn Ledger>,
    chain: Chain,
    identity: String,
    cursor: Mutex<Option<u64>>,
}

impl NonceSequencer {
    pub fn new(ledger: Arc<dyn Ledger>, chain: Chain, identity: impl Into<String>) -> Self {
        Self {
            ledger,
            chain,
            identity: identity.into(),
            cursor: Mutex::new(None),
        }
    }

    pub fn chain(&self) -> Chain {
        self.chain
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Next nonce that will be handed out, if seeded
    pub async fn peek(&self) -> Option<u64> {
        *self.cursor.lock().await
    }

    /// Assign the next nonce to `request` and broadcast it
    ///
    /// The lock is held until the broadcast returns so that broadcast order
    /// matches nonce order. Receipt waiting happens outside the lock.
    pub async fn submit(&self, request: &TxRequest) -> Result<Submitted> {
        if request.chain() != self.chain {
            return Err(Error::Internal(format!(
                "{:?} belongs on {}, not {}",
                request,
                request.chain(),
                self.chain
            )));
        }

        let mut cursor = self.cursor.lock().await;
        let nonce = match *cursor {
            Some(n) => n,
            None => {
                let seeded = self
                    .ledger
                    .transaction_count(self.chain, &self.identity)
                    .await?;
                debug!("Seeded {} nonce cursor at {}", self.chain, seeded);
                seeded
            }
        };
        *cursor = Some(nonce + 1);

        match self.ledger.submit(nonce, request).await {
            Ok(tx_hash) => {
                debug!("Broadcast {} nonce {} -> {}", self.chain, nonce, tx_hash);
                Ok(Submitted { nonce, tx_hash })
            }
            Err(e @ Error::NonceStale { .. }) => {
                // Someone else used this identity; jump past whatever the chain has seen
                match self
                    .ledger
                    .transaction_count(self.chain, &self.identity)
                    .await
                {
                    Ok(on_chain) if on_chain > nonce + 1 => {
                        warn!(
                            "Nonce {} stale on {}, resyncing cursor to {}",
                            nonce, self.chain, on_chain
                        );
                        *cursor = Some(on_chain);
                    }
                    Ok(_) => {}
                    Err(sync_err) => {
                        warn!("Nonce resync on {} failed: {}", self.chain, sync_err)
                    }
                }
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::memory::{MemoryLedger, ScriptedFailure};

    const OPERATOR: &str = "0x9999999999999999999999999999999999999999";

    fn transfer(to: &str) -> TxRequest {
        TxRequest::Transfer {
            to: to.to_string(),
            amount: 1,
        }
    }

    #[tokio::test]
    async fn test_seeds_from_chain() {
        let ledger = Arc::new(MemoryLedger::new(OPERATOR));
        ledger.set_chain_nonce(Chain::Secondary, 7);
        let sequencer = NonceSequencer::new(ledger.clone(), Chain::Secondary, OPERATOR);

        assert_eq!(sequencer.peek().await, None);
        let first = sequencer.submit(&transfer("0xa")).await.unwrap();
        let second = sequencer.submit(&transfer("0xb")).await.unwrap();
        assert_eq!(first.nonce, 7);
        assert_eq!(second.nonce, 8);
        assert_eq!(sequencer.peek().await, Some(9));
    }

    #[tokio::test]
    async fn test_concurrent_submissions_get_distinct_increasing_nonces() {
        let ledger = Arc::new(MemoryLedger::new(OPERATOR));
        let sequencer = Arc::new(NonceSequencer::new(ledger.clone(), Chain::Secondary, OPERATOR));

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let sequencer = sequencer.clone();
                tokio::spawn(async move { sequencer.submit(&transfer(&format!("0x{}", i))).await })
            })
            .collect();

        let mut nonces = Vec::new();
        for handle in handles {
            nonces.push(handle.await.unwrap().unwrap().nonce);
        }
        nonces.sort_unstable();
        assert_eq!(nonces, (0..16).collect::<Vec<_>>());

        // Broadcast order matches assignment order
        let broadcast: Vec<u64> = ledger.submitted().iter().map(|(n, _)| *n).collect();
        assert_eq!(broadcast, (0..16).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_failed_submission_consumes_slot() {
        let ledger = Arc::new(MemoryLedger::new(OPERATOR));
        ledger.script_failures("0xa", vec![ScriptedFailure::Transient]);
        let sequencer = NonceSequencer::new(ledger.clone(), Chain::Secondary, OPERATOR);

        let err = sequencer.submit(&transfer("0xa")).await.unwrap_err();
        assert!(err.is_retryable());

        let next = sequencer.submit(&transfer("0xa")).await.unwrap();
        assert_eq!(next.nonce, 1);
    }

    #[tokio::test]
    async fn test_unknown_outcome_keeps_slot_consumed() {
        let ledger = Arc::new(MemoryLedger::new(OPERATOR));
        ledger.script_failures("0xa", vec![ScriptedFailure::Dropped]);
        let sequencer = NonceSequencer::new(ledger.clone(), Chain::Secondary, OPERATOR);

        let err = sequencer.submit(&transfer("0xa")).await.unwrap_err();
        assert!(matches!(err, Error::SubmitUnknown { nonce: 0, .. }));
        assert_eq!(sequencer.peek().await, Some(1));
    }

    #[tokio::test]
    async fn test_stale_nonce_resyncs_forward() {
        let ledger = Arc::new(MemoryLedger::new(OPERATOR));
        let sequencer = NonceSequencer::new(ledger.clone(), Chain::Secondary, OPERATOR);
        sequencer.submit(&transfer("0xa")).await.unwrap();

        // Another process sends from the same wallet
        ledger.set_chain_nonce(Chain::Secondary, 5);

        let err = sequencer.submit(&transfer("0xb")).await.unwrap_err();
        assert!(matches!(err, Error::NonceStale { nonce: 1 }));
        assert_eq!(sequencer.peek().await, Some(5));

        let retried = sequencer.submit(&transfer("0xb")).await.unwrap();
        assert_eq!(retried.nonce, 5);
    }

    #[tokio::test]
    async fn test_rejects_request_for_other_chain() {
        let ledger = Arc::new(MemoryLedger::new(OPERATOR));
        let sequencer = NonceSequencer::new(ledger, Chain::Secondary, OPERATOR);
        let err = sequencer
            .submit(&TxRequest::ApproveAndRelay { amount: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        assert_eq!(sequencer.peek().await, None);
    }
}
