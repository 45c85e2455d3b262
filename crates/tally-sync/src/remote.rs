//! # Transaction Server Remote
//!
//! The seams between the sync engine and the transaction server, plus the
//! HTTP implementation used in production.
//!
//! ## Endpoints
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          HttpRemote                                     │
//! │                                                                         │
//! │  SaleRemote::create_sale                                               │
//! │    POST {base}/api/sales                                               │
//! │    Idempotency-Key: <local_id>     ← same key on every retry           │
//! │    Authorization: Bearer <api_key> (optional)                          │
//! │    ──► 2xx {"id": "..."}           → SaleAccepted                      │
//! │    ──► 408/425/429/5xx, network    → Transient                         │
//! │    ──► other 4xx                   → Permanent (body = reason)         │
//! │                                                                         │
//! │  CatalogRemote::fetch_catalog                                          │
//! │    GET  {base}/api/catalog         → CatalogSnapshot                   │
//! │                                                                         │
//! │  ReachabilityProbe::probe                                              │
//! │    HEAD {base}/api/health          → any response = reachable          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The server deduplicates on `Idempotency-Key`: a replay of an already
//! accepted sale answers 2xx with the original id.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::error::{RemoteError, SyncError, SyncResult};
use tally_core::{CatalogSnapshot, SalePayload};

/// Header carrying the sale's `local_id`.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

// =============================================================================
// Traits
// =============================================================================

/// Server acknowledgement of a created sale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleAccepted {
    /// Server-assigned sale id.
    #[serde(rename = "id")]
    pub server_id: String,
}

/// Remote create-sale operation.
#[async_trait]
pub trait SaleRemote: Send + Sync {
    /// Submits one sale. Must be safe to repeat with the same key.
    async fn create_sale(
        &self,
        idempotency_key: &str,
        payload: &SalePayload,
    ) -> Result<SaleAccepted, RemoteError>;
}

/// Remote catalog-fetch operation.
#[async_trait]
pub trait CatalogRemote: Send + Sync {
    async fn fetch_catalog(&self) -> Result<CatalogSnapshot, RemoteError>;
}

/// Cheap reachability check feeding the connectivity monitor.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn probe(&self) -> bool;
}

// =============================================================================
// HTTP Implementation
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSaleRequest<'a> {
    local_id: &'a str,
    sale: &'a SalePayload,
}

/// reqwest-backed remote.
///
/// Without a configured base URL every call fails transiently and the
/// probe reports unreachable, so sales stay queued.
#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: reqwest::Client,
    base_url: Option<String>,
    api_key: Option<String>,
}

impl HttpRemote {
    /// Builds a remote from the `[server]` section.
    pub fn new(config: &SyncConfig) -> SyncResult<Self> {
        Self::with_timeout(
            config.server.base_url.as_deref(),
            config.server.api_key.clone(),
            config.request_timeout(),
        )
    }

    /// Builds a remote with an explicit request timeout.
    pub fn with_timeout(
        base_url: Option<&str>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::InvalidConfig(format!("HTTP client: {e}")))?;

        Ok(HttpRemote {
            client,
            base_url: base_url.map(|u| u.trim_end_matches('/').to_string()),
            api_key,
        })
    }

    fn endpoint(&self, path: &str) -> Result<String, RemoteError> {
        self.base_url
            .as_ref()
            .map(|base| format!("{base}{path}"))
            .ok_or_else(|| RemoteError::transient("No transaction server configured"))
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }
}

/// Network-level failures never reached the server's logic: always transient.
fn network_error(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::transient("Request timed out")
    } else {
        RemoteError::transient(format!("Network error: {err}"))
    }
}

async fn error_from_response(resp: reqwest::Response) -> RemoteError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    RemoteError::from_status(status, body)
}

#[async_trait]
impl SaleRemote for HttpRemote {
    async fn create_sale(
        &self,
        idempotency_key: &str,
        payload: &SalePayload,
    ) -> Result<SaleAccepted, RemoteError> {
        let url = self.endpoint("/api/sales")?;
        debug!(local_id = %idempotency_key, %url, "Submitting sale");

        let req = self
            .client
            .post(&url)
            .header(IDEMPOTENCY_HEADER, idempotency_key)
            .json(&CreateSaleRequest {
                local_id: idempotency_key,
                sale: payload,
            });

        let resp = self.authorize(req).send().await.map_err(network_error)?;

        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }

        // A 2xx we cannot read may still have created the sale; retrying
        // under the same key is safe, rejecting would lose it.
        resp.json::<SaleAccepted>().await.map_err(|e| {
            warn!(local_id = %idempotency_key, ?e, "Unreadable create-sale response");
            RemoteError::transient(format!("Unreadable server response: {e}"))
        })
    }
}

#[async_trait]
impl CatalogRemote for HttpRemote {
    async fn fetch_catalog(&self) -> Result<CatalogSnapshot, RemoteError> {
        let url = self.endpoint("/api/catalog")?;
        let resp = self
            .authorize(self.client.get(&url))
            .send()
            .await
            .map_err(network_error)?;

        if !resp.status().is_success() {
            return Err(error_from_response(resp).await);
        }

        resp.json::<CatalogSnapshot>()
            .await
            .map_err(|e| RemoteError::transient(format!("Unreadable catalog: {e}")))
    }
}

#[async_trait]
impl ReachabilityProbe for HttpRemote {
    async fn probe(&self) -> bool {
        let Ok(url) = self.endpoint("/api/health") else {
            return false;
        };

        // Any HTTP answer means the server is reachable; only transport
        // failures count as offline.
        self.client.head(&url).send().await.is_ok()
    }
}
