//! Membership / earnings source
//!
//! Loads the snapshot of who is owed what. Raw records are loosely typed on
//! the wire; they are validated into `Account`s here and nowhere else.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use crate::config::MembershipConfig;
use crate::error::{Error, Result};
use crate::migration::types::{parse_amount, Account};

lazy_static! {
    static ref ADDRESS_RE: Regex = Regex::new(r"^0x[0-9a-fA-F]{40}$").expect("static regex");
}

/// Check that `address` is a 20-byte hex address
pub fn is_valid_address(address: &str) -> bool {
    ADDRESS_RE.is_match(address)
}

/// Member record as returned by the membership API
#[derive(Debug, Clone, Deserialize)]
pub struct MemberRecord {
    pub address: Option<String>,
    /// Decimal string (numbers are accepted too)
    pub earnings: Option<serde_json::Value>,
    #[serde(default)]
    pub active: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MembersPage {
    members: Vec<MemberRecord>,
}

/// Source of the membership / earnings snapshot
#[async_trait]
pub trait MembershipSource: Send + Sync {
    /// Every member record registered for `ledger_id`, across all pages
    async fn list_members(&self, ledger_id: &str) -> Result<Vec<MemberRecord>>;
}

/// Validate raw records into the initial work set
///
/// Inactive members are dropped. When `whitelist` is non-empty only listed
/// addresses are kept. Malformed or duplicate records are fatal: a snapshot we
/// cannot trust must not drive payouts.
pub fn build_accounts(records: Vec<MemberRecord>, whitelist: &[String]) -> Result<Vec<Account>> {
    let allowed: HashSet<String> = whitelist.iter().map(|a| a.to_lowercase()).collect();
    let mut seen = HashSet::new();
    let mut accounts = Vec::new();

    for (index, record) in records.into_iter().enumerate() {
        let address = record.address.ok_or_else(|| {
            Error::MalformedMember(format!("record #{} has no address", index))
        })?;
        if !is_valid_address(&address) {
            return Err(Error::MalformedMember(format!(
                "record #{} has invalid address {:?}",
                index, address
            )));
        }

        let key = address.to_lowercase();
        if !seen.insert(key.clone()) {
            return Err(Error::MalformedMember(format!(
                "duplicate member address {}",
                address
            )));
        }

        let earnings = match &record.earnings {
            Some(serde_json::Value::String(s)) => parse_amount(s),
            Some(serde_json::Value::Number(n)) => n.as_u64().map(u128::from),
            _ => None,
        }
        .ok_or_else(|| {
            Error::MalformedMember(format!(
                "member {} has invalid earnings {:?}",
                address, record.earnings
            ))
        })?;

        if !record.active {
            debug!("Skipping inactive member {}", address);
            continue;
        }
        if !allowed.is_empty() && !allowed.contains(&key) {
            continue;
        }

        let seq = accounts.len() as u64;
        accounts.push(Account::new(address, earnings, seq));
    }

    Ok(accounts)
}

/// Paginated HTTP membership API client
pub struct HttpMembershipSource {
    client: Client,
    base_url: Url,
    page_size: usize,
}

impl HttpMembershipSource {
    pub fn new(config: &MembershipConfig) -> Result<Self> {
        let mut base_url = Url::parse(&config.api_url)
            .map_err(|e| Error::Config(format!("Invalid membership api_url: {}", e)))?;
        if !base_url.path().ends_with('/') {
            base_url.set_path(&format!("{}/", base_url.path()));
        }

        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            page_size: config.page_size.max(1),
        })
    }

    async fn fetch_page(&self, ledger_id: &str, page: usize) -> Result<Vec<MemberRecord>> {
        let mut url = self
            .base_url
            .join(&format!("ledgers/{}/members", ledger_id))
            .map_err(|e| Error::Internal(format!("Bad membership path: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("page", &page.to_string())
            .append_pair("pageSize", &self.page_size.to_string());

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Membership(format!("HTTP request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::Membership(format!(
                "page {} returned {}",
                page,
                response.status()
            )));
        }

        let page: MembersPage = response
            .json()
            .await
            .map_err(|e| Error::Deserialization(format!("Failed to parse members page: {}", e)))?;
        Ok(page.members)
    }
}

#[async_trait]
impl MembershipSource for HttpMembershipSource {
    async fn list_members(&self, ledger_id: &str) -> Result<Vec<MemberRecord>> {
        let mut all = Vec::new();
        let mut page = 0;

        loop {
            let records = self.fetch_page(ledger_id, page).await?;
            let count = records.len();
            debug!("Members page {}: {} records", page, count);
            all.extend(records);

            if count < self.page_size {
                break;
            }
            page += 1;
        }

        info!("Fetched {} member records for {}", all.len(), ledger_id);
        Ok(all)
    }
}
