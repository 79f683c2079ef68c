//! Block explorer client
//!
//! Queries a mempool-style explorer REST API (`GET {base}/api/tx/{txid}`)
//! and maps the response onto the neutral [`TxLookup`] shape the state
//! machine consumes. Every failure mode, including an unknown transaction,
//! surfaces as a [`LookupFailure`] so the poll loop retries instead of
//! touching the trade.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::chain::ChainLookup;
use crate::error::LookupFailure;
use crate::types::{TxLookup, TxOutput};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Explorer response shape, trimmed to the fields we read
#[derive(Debug, Deserialize)]
struct ExplorerTx {
    status: ExplorerStatus,
    #[serde(default)]
    vout: Vec<ExplorerVout>,
}

#[derive(Debug, Deserialize)]
struct ExplorerStatus {
    confirmed: bool,
}

#[derive(Debug, Deserialize)]
struct ExplorerVout {
    scriptpubkey_address: Option<String>,
    value: u64,
}

pub struct ExplorerClient {
    http: reqwest::Client,
    base_url: String,
}

impl ExplorerClient {
    pub fn new(base_url: &str) -> Result<Self, LookupFailure> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| LookupFailure(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ChainLookup for ExplorerClient {
    async fn request_tx(&self, tx_id: &str) -> Result<TxLookup, LookupFailure> {
        let url = format!("{}/api/tx/{}", self.base_url, tx_id);
        debug!("Fetching {}", url);

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| LookupFailure(format!("Explorer request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(LookupFailure(format!(
                "Explorer returned {} for {}",
                response.status(),
                tx_id
            )));
        }

        let tx: ExplorerTx = response
            .json()
            .await
            .map_err(|e| LookupFailure(format!("Malformed explorer response: {}", e)))?;

        Ok(TxLookup {
            tx_id: tx_id.to_string(),
            outputs: tx
                .vout
                .into_iter()
                .filter_map(|out| {
                    out.scriptpubkey_address.map(|address| TxOutput {
                        address,
                        value: out.value,
                    })
                })
                .collect(),
            confirmed: tx.status.confirmed,
        })
    }
}
