//! # Cache Refresher
//!
//! Keeps a read-only catalog snapshot on the terminal so products and
//! customers can be looked up while offline.
//!
//! Refreshes replace the snapshot wholesale; a failed fetch leaves the
//! previous snapshot in place.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::SyncResult;
use crate::remote::CatalogRemote;
use tally_core::{CacheSummary, CatalogLookup};
use tally_db::{CatalogRepository, Database};

/// Fetches and serves the catalog snapshot.
#[derive(Clone)]
pub struct CacheRefresher {
    catalog: CatalogRepository,
    remote: Arc<dyn CatalogRemote>,
    lookup_limit: u32,
}

impl CacheRefresher {
    pub fn new(db: &Database, remote: Arc<dyn CatalogRemote>, lookup_limit: u32) -> Self {
        CacheRefresher {
            catalog: db.catalog(),
            remote,
            lookup_limit,
        }
    }

    /// Fetches the full catalog and replaces the cached snapshot.
    pub async fn refresh_all(&self) -> SyncResult<CacheSummary> {
        debug!("Fetching catalog snapshot");
        let snapshot = self.remote.fetch_catalog().await?;

        let summary = self.catalog.replace_all(&snapshot, Utc::now()).await?;
        info!(
            products = summary.products,
            customers = summary.customers,
            "Catalog cache refreshed"
        );
        Ok(summary)
    }

    /// Local-only search over the cached snapshot.
    pub async fn lookup(&self, query: &str) -> SyncResult<CatalogLookup> {
        Ok(self.catalog.lookup(query, self.lookup_limit).await?)
    }

    /// Counts and fetch time of the current snapshot.
    pub async fn snapshot_info(&self) -> SyncResult<CacheSummary> {
        Ok(self.catalog.summary().await?)
    }
}

impl std::fmt::Debug for CacheRefresher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheRefresher")
            .field("lookup_limit", &self.lookup_limit)
            .finish_non_exhaustive()
    }
}
