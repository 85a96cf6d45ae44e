//! Ledger gateway client
//!
//! The gateway is a signing JSON service in front of both networks. It holds
//! the operating wallet key, encodes contract calls and broadcasts them with
//! the sequence number we hand it. This keeps key material and ABI handling
//! out of the migrator.
//!
//! Reads are idempotent and retried with exponential backoff. Writes are
//! attempted exactly once: a resend must go through the nonce sequencer again.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use reqwest::{Client, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{LedgerConfig, MigrationConfig};
use crate::error::{Error, Result};
use crate::migration::types::{amount_string, Amount, Chain, LedgerSide};

use super::{Ledger, MemberStatus, Receipt, TxRequest};

#[derive(Debug, Deserialize)]
struct AmountResponse {
    #[serde(with = "amount_string")]
    amount: Amount,
}

#[derive(Debug, Deserialize)]
struct AddressResponse {
    address: String,
}

#[derive(Debug, Deserialize)]
struct CodeResponse {
    code: String,
}

#[derive(Debug, Deserialize)]
struct NonceResponse {
    nonce: u64,
}

#[derive(Debug, Deserialize)]
struct MemberResponse {
    status: MemberStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    tx_hash: Option<String>,
    error: Option<String>,
    code: Option<String>,
}

#[derive(Debug, Serialize)]
struct SubmitRequest<'a> {
    from: &'a str,
    nonce: u64,
    contract: &'a str,
    #[serde(flatten)]
    request: &'a TxRequest,
}

/// Error payload returned by the gateway on non-2xx responses
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    #[serde(default)]
    code: Option<String>,
}

/// Contract addresses the gateway calls into
#[derive(Debug, Clone)]
pub struct LedgerContracts {
    pub legacy: String,
    pub new_primary: String,
    pub new_secondary: String,
    pub operator: String,
}

impl From<&MigrationConfig> for LedgerContracts {
    fn from(config: &MigrationConfig) -> Self {
        Self {
            legacy: config.legacy_ledger.clone(),
            new_primary: config.new_ledger_primary.clone(),
            new_secondary: config.new_ledger_secondary.clone(),
            operator: config.operator.clone(),
        }
    }
}

/// HTTP client for the ledger gateway
pub struct GatewayLedger {
    client: Client,
    base_url: Url,
    api_key: Option<String>,
    contracts: LedgerContracts,
    config: LedgerConfig,
}

impl GatewayLedger {
    /// Create a new gateway client
    pub fn new(config: LedgerConfig, contracts: LedgerContracts) -> Result<Self> {
        let mut base_url = Url::parse(&config.gateway_url)
            .map_err(|e| Error::Config(format!("Invalid gateway_url: {}", e)))?;
        // Url::join drops the last segment unless the base ends with '/'
        if !base_url.path().ends_with('/') {
            base_url.set_path(&format!("{}/", base_url.path()));
        }

        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        let api_key = if config.api_key.is_empty() {
            None
        } else {
            Some(config.api_key.clone())
        };

        info!("Ledger gateway client initialized for {}", config.gateway_url);

        Ok(Self {
            client,
            base_url,
            api_key,
            contracts,
            config,
        })
    }

    /// Addresses this client is bound to
    pub fn contracts(&self) -> &LedgerContracts {
        &self.contracts
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| Error::Internal(format!("Bad gateway path {}: {}", path, e)))
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_millis(self.config.retry_base_delay_ms),
            max_interval: Duration::from_millis(self.config.retry_base_delay_ms * 8),
            max_elapsed_time: Some(Duration::from_millis(
                self.config.retry_base_delay_ms * 2u64.pow(self.config.max_retries),
            )),
            ..Default::default()
        }
    }

    /// Single GET attempt, `Ok(None)` on 404
    async fn get_once<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let url = self.url(path)?;
        let response = self.authorize(self.client.get(url)).send().await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = match response.text().await {
                Ok(body) => body,
                Err(e) => {
                    warn!("Failed to read {} error body from {}: {}", status, path, e);
                    String::new()
                }
            };
            return Err(classify_failure(status, &body));
        }

        let value = response
            .json::<T>()
            .await
            .map_err(|e| Error::Deserialization(format!("Failed to parse {}: {}", path, e)))?;
        Ok(Some(value))
    }

    /// GET with retry on transient errors
    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        retry(self.backoff(), || async {
            match self.get_once(path).await {
                Ok(value) => Ok(value),
                Err(e) if e.is_retryable() => {
                    warn!("Retryable gateway error on {}: {}", path, e);
                    Err(backoff::Error::transient(e))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        })
        .await
    }

    async fn get_required<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.get(path)
            .await?
            .ok_or_else(|| Error::Rpc(format!("Gateway has no data at {}", path)))
    }

    fn ledger_for(&self, side: LedgerSide) -> (Chain, &str) {
        match side {
            LedgerSide::Legacy => (Chain::Primary, &self.contracts.legacy),
            LedgerSide::New => (Chain::Primary, &self.contracts.new_primary),
        }
    }

    fn target_contract(&self, request: &TxRequest) -> &str {
        match request {
            TxRequest::ApproveAndRelay { .. } => &self.contracts.new_primary,
            TxRequest::Transfer { .. } | TxRequest::Approve { .. } | TxRequest::AddMembers { .. } => {
                &self.contracts.new_secondary
            }
        }
    }
}

#[async_trait]
impl Ledger for GatewayLedger {
    async fn token_balance(&self, chain: Chain, holder: &str) -> Result<Amount> {
        let path = format!("chains/{}/balances/{}", chain, holder);
        Ok(self.get_required::<AmountResponse>(&path).await?.amount)
    }

    async fn withdrawn(&self, account: &str) -> Result<Amount> {
        let path = format!(
            "chains/primary/ledgers/{}/withdrawn/{}",
            self.contracts.legacy, account
        );
        Ok(self.get_required::<AmountResponse>(&path).await?.amount)
    }

    async fn migrated(&self, account: &str) -> Result<Amount> {
        let path = format!(
            "chains/secondary/ledgers/{}/earnings/{}",
            self.contracts.new_secondary, account
        );
        // Not a member yet: nothing migrated
        Ok(self
            .get::<AmountResponse>(&path)
            .await?
            .map(|r| r.amount)
            .unwrap_or(0))
    }

    async fn total_migrated(&self) -> Result<Amount> {
        let path = format!(
            "chains/secondary/ledgers/{}/total-earnings",
            self.contracts.new_secondary
        );
        Ok(self.get_required::<AmountResponse>(&path).await?.amount)
    }

    async fn member_status(&self, account: &str) -> Result<MemberStatus> {
        let path = format!(
            "chains/secondary/ledgers/{}/members/{}",
            self.contracts.new_secondary, account
        );
        Ok(self
            .get::<MemberResponse>(&path)
            .await?
            .map(|r| r.status)
            .unwrap_or(MemberStatus::None))
    }

    async fn token_address(&self, side: LedgerSide) -> Result<String> {
        let (chain, ledger) = self.ledger_for(side);
        let path = format!("chains/{}/ledgers/{}/token", chain, ledger);
        Ok(self.get_required::<AddressResponse>(&path).await?.address)
    }

    async fn code_at(&self, chain: Chain, address: &str) -> Result<Vec<u8>> {
        let path = format!("chains/{}/code/{}", chain, address);
        match self.get::<CodeResponse>(&path).await? {
            Some(r) => decode_hex(&r.code),
            None => Ok(Vec::new()),
        }
    }

    async fn transaction_count(&self, chain: Chain, identity: &str) -> Result<u64> {
        let path = format!("chains/{}/nonce/{}", chain, identity);
        Ok(self.get_required::<NonceResponse>(&path).await?.nonce)
    }

    async fn submit(&self, nonce: u64, request: &TxRequest) -> Result<String> {
        let chain = request.chain();
        let url = self.url(&format!("chains/{}/transactions", chain))?;
        let body = SubmitRequest {
            from: &self.contracts.operator,
            nonce,
            contract: self.target_contract(request),
            request,
        };

        debug!("Submitting {:?} on {} with nonce {}", request, chain, nonce);

        let response = self
            .authorize(self.client.post(url))
            .json(&body)
            .send()
            .await
            .map_err(|e| send_failure(nonce, e))?;

        let status = response.status();
        let text = match response.text().await {
            Ok(text) => text,
            Err(e) if status.is_success() => {
                warn!("Submission with nonce {} accepted but response unreadable: {}", nonce, e);
                return Err(Error::SubmitUnknown {
                    nonce,
                    reason: format!("response body unreadable: {}", e),
                });
            }
            Err(e) => {
                warn!("Failed to read {} submit error body: {}", status, e);
                String::new()
            }
        };
        if !status.is_success() {
            return Err(classify_submit_failure(nonce, status, &text));
        }

        let submit: SubmitResponse = serde_json::from_str(&text)
            .map_err(|e| Error::Deserialization(format!("Failed to parse response: {}", e)))?;

        if let Some(error) = submit.error {
            return Err(classify_error(submit.code.as_deref(), error));
        }

        submit
            .tx_hash
            .ok_or_else(|| Error::TransactionSend("No tx hash in response".to_string()))
    }

    async fn wait_for_receipt(&self, chain: Chain, tx_hash: &str) -> Result<Receipt> {
        let path = format!("chains/{}/receipts/{}", chain, tx_hash);
        let started = Instant::now();
        let deadline = Duration::from_millis(self.config.receipt_timeout_ms);
        let poll = Duration::from_millis(self.config.receipt_poll_ms);

        loop {
            if let Some(receipt) = self.get::<Receipt>(&path).await? {
                debug!("Receipt for {}: {:?}", tx_hash, receipt.status);
                return Ok(receipt);
            }
            if started.elapsed() >= deadline {
                return Err(Error::RpcTimeout(self.config.receipt_timeout_ms));
            }
            tokio::time::sleep(poll).await;
        }
    }
}

/// A request that never left this host cannot have been broadcast
fn send_failure(nonce: u64, e: reqwest::Error) -> Error {
    if e.is_connect() || e.is_builder() || (e.is_request() && !e.is_timeout()) {
        Error::TransactionSend(format!("HTTP request failed: {}", e))
    } else {
        Error::SubmitUnknown {
            nonce,
            reason: format!("HTTP request failed: {}", e),
        }
    }
}

/// Map a non-2xx submit response, keeping broadcasts that may have happened apart
fn classify_submit_failure(nonce: u64, status: StatusCode, body: &str) -> Error {
    let parsed = serde_json::from_str::<ErrorResponse>(body).ok();
    let code = parsed.as_ref().and_then(|e| e.code.as_deref());
    let message = parsed
        .as_ref()
        .map(|e| e.error.clone())
        .unwrap_or_else(|| body.to_string());

    let unknown = match code {
        Some("timeout") => true,
        Some(_) => false,
        None => {
            status == StatusCode::REQUEST_TIMEOUT
                || status == StatusCode::GATEWAY_TIMEOUT
                || status == StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    if unknown {
        Error::SubmitUnknown {
            nonce,
            reason: format!("{}: {}", status, message),
        }
    } else {
        classify_failure(status, body)
    }
}

/// Map a non-2xx gateway response to an error class
fn classify_failure(status: StatusCode, body: &str) -> Error {
    let parsed = serde_json::from_str::<ErrorResponse>(body).ok();
    if let Some(err) = parsed {
        if err.code.is_some() {
            return classify_error(err.code.as_deref(), err.error);
        }
        return status_error(status, err.error);
    }
    status_error(status, body.to_string())
}

fn status_error(status: StatusCode, message: String) -> Error {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Error::Rpc(format!("{}: {}", status, message))
    } else if status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::GATEWAY_TIMEOUT {
        Error::Rpc(format!("timeout: {}", message))
    } else {
        Error::Internal(format!("Gateway returned {}: {}", status, message))
    }
}

/// Map a gateway error code to an error class
fn classify_error(code: Option<&str>, message: String) -> Error {
    match code {
        Some("nonce_too_low") | Some("nonce_stale") => Error::NonceStale {
            nonce: extract_nonce(&message).unwrap_or_default(),
        },
        Some("reverted") | Some("rejected") => Error::Rejected(message),
        Some("timeout") | Some("unavailable") => Error::Rpc(message),
        _ => Error::TransactionSend(message),
    }
}

fn extract_nonce(message: &str) -> Option<u64> {
    message
        .split(|c: char| !c.is_ascii_digit())
        .find(|s| !s.is_empty())
        .and_then(|s| s.parse().ok())
}

/// Decode a `0x`-prefixed hex string
fn decode_hex(s: &str) -> Result<Vec<u8>> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    if !digits.is_ascii() || digits.len() % 2 != 0 {
        return Err(Error::Deserialization(format!("Malformed hex: {}", s)));
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|e| Error::Deserialization(format!("Invalid hex {}: {}", s, e)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_nonce_too_low_is_transient() {
        let err = classify_error(Some("nonce_too_low"), "nonce 41 too low".to_string());
        assert!(matches!(err, Error::NonceStale { nonce: 41 }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_classify_revert_is_rejection() {
        let err = classify_failure(
            StatusCode::UNPROCESSABLE_ENTITY,
            r#"{"error":"recipient not eligible","code":"reverted"}"#,
        );
        assert!(err.is_rejection());
    }

    #[test]
    fn test_classify_server_error_is_transient() {
        let err = classify_failure(StatusCode::BAD_GATEWAY, "upstream down");
        assert!(err.is_retryable());

        let err = classify_failure(StatusCode::BAD_REQUEST, r#"{"error":"bad address"}"#);
        assert!(!err.is_retryable());
        assert!(!err.is_rejection());
    }

    #[test]
    fn test_submit_timeouts_are_unknown_outcomes() {
        let err = classify_submit_failure(9, StatusCode::GATEWAY_TIMEOUT, "upstream timed out");
        assert!(matches!(err, Error::SubmitUnknown { nonce: 9, .. }));
        assert!(!err.is_retryable());

        let err = classify_submit_failure(
            9,
            StatusCode::SERVICE_UNAVAILABLE,
            r#"{"error":"broadcast timed out","code":"timeout"}"#,
        );
        assert!(err.is_ambiguous());

        // Definitive answers keep their class
        let err = classify_submit_failure(
            9,
            StatusCode::INTERNAL_SERVER_ERROR,
            r#"{"error":"nonce 12 too low","code":"nonce_too_low"}"#,
        );
        assert!(matches!(err, Error::NonceStale { nonce: 12 }));

        let err = classify_submit_failure(9, StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert!(err.is_retryable());
        assert!(!err.is_ambiguous());
    }

    #[test]
    fn test_decode_hex() {
        assert_eq!(decode_hex("0x").unwrap(), Vec::<u8>::new());
        assert_eq!(decode_hex("0x6080ff").unwrap(), vec![0x60, 0x80, 0xff]);
        assert!(decode_hex("0x123").is_err());
    }

    #[test]
    fn test_submit_body_shape() {
        let request = TxRequest::Transfer {
            to: "0xbeef".to_string(),
            amount: 10,
        };
        let body = SubmitRequest {
            from: "0xop",
            nonce: 3,
            contract: "0xnew",
            request: &request,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["nonce"], 3);
        assert_eq!(json["kind"], "transfer");
        assert_eq!(json["amount"], "10");
        assert_eq!(json["contract"], "0xnew");
    }

    #[test]
    fn test_base_url_gets_trailing_slash() {
        let config = LedgerConfig {
            gateway_url: "http://localhost:8545/api".to_string(),
            ..LedgerConfig::default()
        };
        let contracts = LedgerContracts {
            legacy: "0x1".into(),
            new_primary: "0x2".into(),
            new_secondary: "0x3".into(),
            operator: "0x4".into(),
        };
        let ledger = GatewayLedger::new(config, contracts).unwrap();
        assert_eq!(
            ledger.url("chains/primary/nonce/0x4").unwrap().as_str(),
            "http://localhost:8545/api/chains/primary/nonce/0x4"
        );
    }
}
