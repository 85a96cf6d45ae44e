//! In-memory ledger for scenario tests
//!
//! Scripts balances, per-account failures and bridge latency so the engine can
//! be driven end to end without a network.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::migration::types::{Amount, Chain, LedgerSide};

use super::{Ledger, MemberStatus, Receipt, ReceiptStatus, TxRequest};

/// Scripted failure for the next transfer to an account
#[derive(Debug, Clone)]
pub enum ScriptedFailure {
    /// Broadcast fails with a retryable network error
    Transient,
    /// Broadcast succeeds but the receipt reverts
    Revert(String),
    /// Never reaches the chain, yet the gateway cannot say so
    Dropped,
    /// Sits in the mempool with its nonce taken and never executes
    Stuck,
    /// Executes, but the gateway reply is lost
    ReplyLost,
    /// Executes, but the first receipt wait times out
    SlowReceipt,
}

#[derive(Debug, Default)]
struct State {
    balances: HashMap<(Chain, String), Amount>,
    withdrawn: HashMap<String, Amount>,
    migrated: HashMap<String, Amount>,
    members: HashMap<String, MemberStatus>,
    tokens: HashMap<&'static str, String>,
    code: HashSet<(Chain, String)>,
    nonces: HashMap<Chain, u64>,
    receipts: HashMap<String, Receipt>,
    failures: HashMap<String, VecDeque<ScriptedFailure>>,
    allowance: Amount,
    bridge_in_flight: Amount,
    bridge_polls_left: Option<u32>,
    submitted: Vec<(u64, TxRequest)>,
    next_block: u64,
    slow_receipts: HashSet<String>,
    cancel_on_transfer: Option<CancellationToken>,
}

/// Deterministic in-memory `Ledger`
pub struct MemoryLedger {
    operator: String,
    state: Mutex<State>,
}

impl MemoryLedger {
    pub fn new(operator: &str) -> Self {
        let mut state = State {
            bridge_polls_left: Some(0),
            ..Default::default()
        };
        state.tokens.insert("legacy", "0xtoken".to_string());
        state.tokens.insert("new", "0xtoken".to_string());
        Self {
            operator: operator.to_lowercase(),
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn set_balance(&self, chain: Chain, holder: &str, amount: Amount) {
        self.lock()
            .balances
            .insert((chain, holder.to_lowercase()), amount);
    }

    pub fn balance(&self, chain: Chain, holder: &str) -> Amount {
        self.lock()
            .balances
            .get(&(chain, holder.to_lowercase()))
            .copied()
            .unwrap_or(0)
    }

    pub fn set_withdrawn(&self, account: &str, amount: Amount) {
        self.lock().withdrawn.insert(account.to_lowercase(), amount);
    }

    pub fn set_migrated(&self, account: &str, amount: Amount) {
        self.lock().migrated.insert(account.to_lowercase(), amount);
    }

    pub fn migrated_of(&self, account: &str) -> Amount {
        self.lock()
            .migrated
            .get(&account.to_lowercase())
            .copied()
            .unwrap_or(0)
    }

    pub fn set_member(&self, account: &str, status: MemberStatus) {
        self.lock().members.insert(account.to_lowercase(), status);
    }

    pub fn set_token(&self, side: LedgerSide, token: &str) {
        let key = match side {
            LedgerSide::Legacy => "legacy",
            LedgerSide::New => "new",
        };
        self.lock().tokens.insert(key, token.to_string());
    }

    pub fn deploy(&self, chain: Chain, address: &str) {
        self.lock().code.insert((chain, address.to_lowercase()));
    }

    pub fn set_chain_nonce(&self, chain: Chain, nonce: u64) {
        self.lock().nonces.insert(chain, nonce);
    }

    /// Queue failures for the next transfers to `account`
    pub fn script_failures(&self, account: &str, failures: Vec<ScriptedFailure>) {
        self.lock()
            .failures
            .entry(account.to_lowercase())
            .or_default()
            .extend(failures);
    }

    /// Relayed funds show up after this many secondary balance reads, `None` = never
    pub fn set_bridge_delay(&self, polls: Option<u32>) {
        self.lock().bridge_polls_left = polls;
    }

    /// Cancel `token` as soon as a transfer is broadcast
    pub fn cancel_on_transfer(&self, token: CancellationToken) {
        self.lock().cancel_on_transfer = Some(token);
    }

    pub fn allowance(&self) -> Amount {
        self.lock().allowance
    }

    /// Every broadcast request with its nonce, in broadcast order
    pub fn submitted(&self) -> Vec<(u64, TxRequest)> {
        self.lock().submitted.clone()
    }

    /// Amounts of broadcast transfers, in broadcast order
    pub fn transfers(&self) -> Vec<(String, Amount)> {
        self.lock()
            .submitted
            .iter()
            .filter_map(|(_, r)| match r {
                TxRequest::Transfer { to, amount } => Some((to.clone(), *amount)),
                _ => None,
            })
            .collect()
    }

    pub fn relay_count(&self) -> usize {
        self.lock()
            .submitted
            .iter()
            .filter(|(_, r)| matches!(r, TxRequest::ApproveAndRelay { .. }))
            .count()
    }

    fn receipt(state: &mut State, status: ReceiptStatus) -> String {
        state.next_block += 1;
        let tx_hash = format!("0x{:064x}", state.submitted.len());
        state.receipts.insert(
            tx_hash.clone(),
            Receipt {
                tx_hash: tx_hash.clone(),
                block: state.next_block,
                status,
            },
        );
        tx_hash
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn token_balance(&self, chain: Chain, holder: &str) -> Result<Amount> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let holder = holder.to_lowercase();

        if chain == Chain::Secondary && holder == self.operator && state.bridge_in_flight > 0 {
            match state.bridge_polls_left {
                Some(0) => {
                    let arrived = std::mem::take(&mut state.bridge_in_flight);
                    *state.balances.entry((chain, holder.clone())).or_default() += arrived;
                }
                Some(n) => state.bridge_polls_left = Some(n - 1),
                None => {}
            }
        }

        Ok(state.balances.get(&(chain, holder)).copied().unwrap_or(0))
    }

    async fn withdrawn(&self, account: &str) -> Result<Amount> {
        Ok(self
            .lock()
            .withdrawn
            .get(&account.to_lowercase())
            .copied()
            .unwrap_or(0))
    }

    async fn migrated(&self, account: &str) -> Result<Amount> {
        Ok(self.migrated_of(account))
    }

    async fn total_migrated(&self) -> Result<Amount> {
        Ok(self.lock().migrated.values().sum())
    }

    async fn member_status(&self, account: &str) -> Result<MemberStatus> {
        Ok(self
            .lock()
            .members
            .get(&account.to_lowercase())
            .copied()
            .unwrap_or(MemberStatus::None))
    }

    async fn token_address(&self, side: LedgerSide) -> Result<String> {
        let key = match side {
            LedgerSide::Legacy => "legacy",
            LedgerSide::New => "new",
        };
        Ok(self.lock().tokens.get(key).cloned().unwrap_or_default())
    }

    async fn code_at(&self, chain: Chain, address: &str) -> Result<Vec<u8>> {
        if self.lock().code.contains(&(chain, address.to_lowercase())) {
            Ok(vec![0x60, 0x80])
        } else {
            Ok(Vec::new())
        }
    }

    async fn transaction_count(&self, chain: Chain, _identity: &str) -> Result<u64> {
        Ok(self.lock().nonces.get(&chain).copied().unwrap_or(0))
    }

    async fn submit(&self, nonce: u64, request: &TxRequest) -> Result<String> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let chain = request.chain();
        let expected = state.nonces.get(&chain).copied().unwrap_or(0);
        if nonce < expected {
            return Err(Error::NonceStale { nonce });
        }

        let lost_reply = || Error::SubmitUnknown {
            nonce,
            reason: "gateway timed out".to_string(),
        };

        let mut scripted = None;
        if let TxRequest::Transfer { to, .. } = request {
            scripted = state
                .failures
                .get_mut(&to.to_lowercase())
                .and_then(|q| q.pop_front());
            if let Some(token) = &state.cancel_on_transfer {
                token.cancel();
            }
            match &scripted {
                Some(ScriptedFailure::Transient) => {
                    return Err(Error::Rpc("connection reset".to_string()))
                }
                Some(ScriptedFailure::Dropped) => return Err(lost_reply()),
                Some(ScriptedFailure::Stuck) => {
                    state.nonces.insert(chain, nonce + 1);
                    state.submitted.push((nonce, request.clone()));
                    return Err(lost_reply());
                }
                Some(ScriptedFailure::Revert(reason)) => {
                    state.nonces.insert(chain, nonce + 1);
                    state.submitted.push((nonce, request.clone()));
                    return Ok(Self::receipt(state, ReceiptStatus::Reverted(reason.clone())));
                }
                _ => {}
            }
        }

        state.nonces.insert(chain, nonce + 1);
        state.submitted.push((nonce, request.clone()));
        let operator = self.operator.clone();

        let status = match request {
            TxRequest::Transfer { to, amount } => {
                let balance = state
                    .balances
                    .entry((Chain::Secondary, operator))
                    .or_default();
                if *balance < *amount || state.allowance < *amount {
                    ReceiptStatus::Reverted("insufficient balance or allowance".to_string())
                } else {
                    *balance -= *amount;
                    state.allowance -= *amount;
                    *state.migrated.entry(to.to_lowercase()).or_default() += *amount;
                    state
                        .members
                        .entry(to.to_lowercase())
                        .or_insert(MemberStatus::Active);
                    ReceiptStatus::Success
                }
            }
            TxRequest::ApproveAndRelay { amount } => {
                let balance = state.balances.entry((Chain::Primary, operator)).or_default();
                if *balance < *amount {
                    ReceiptStatus::Reverted("insufficient balance".to_string())
                } else {
                    *balance -= *amount;
                    state.bridge_in_flight += *amount;
                    ReceiptStatus::Success
                }
            }
            TxRequest::Approve { amount, .. } => {
                state.allowance = *amount;
                ReceiptStatus::Success
            }
            TxRequest::AddMembers { addresses } => {
                let already_active = addresses.iter().any(|a| {
                    state.members.get(&a.to_lowercase()) == Some(&MemberStatus::Active)
                });
                if already_active {
                    ReceiptStatus::Reverted("member already active".to_string())
                } else {
                    for a in addresses {
                        state.members.insert(a.to_lowercase(), MemberStatus::Active);
                    }
                    ReceiptStatus::Success
                }
            }
        };

        let tx_hash = Self::receipt(state, status);
        match scripted {
            Some(ScriptedFailure::ReplyLost) => Err(lost_reply()),
            Some(ScriptedFailure::SlowReceipt) => {
                state.slow_receipts.insert(tx_hash.clone());
                Ok(tx_hash)
            }
            _ => Ok(tx_hash),
        }
    }

    async fn wait_for_receipt(&self, _chain: Chain, tx_hash: &str) -> Result<Receipt> {
        let mut state = self.lock();
        if state.slow_receipts.remove(tx_hash) {
            return Err(Error::RpcTimeout(300_000));
        }
        state
            .receipts
            .get(tx_hash)
            .cloned()
            .ok_or_else(|| Error::Rpc(format!("unknown transaction {}", tx_hash)))
    }
}
