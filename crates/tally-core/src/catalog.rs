//! # Catalog Types
//!
//! Read-only catalog data cached on the terminal so checkout keeps working
//! offline. The cache is never edited locally; every successful refresh
//! replaces the whole snapshot.
//!
//! ```text
//! Transaction server ──fetch_catalog──► CatalogSnapshot
//!                                           │ replace_all (one transaction)
//!                                           ▼
//!                              catalog_products / catalog_customers
//!                                           │ lookup(query)
//!                                           ▼
//!                                  CachedEntity<T> { entity, fetched_at }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// A product as the server publishes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct CatalogProduct {
    pub id: String,
    pub sku: String,
    #[serde(default)]
    pub barcode: Option<String>,
    pub name: String,
    pub price_cents: i64,
    /// Tax rate in basis points (825 = 8.25%).
    #[serde(default)]
    pub tax_rate_bps: u32,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

/// A customer record used for attaching sales to accounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct CatalogCustomer {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

/// Full catalog returned by the remote catalog-fetch operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct CatalogSnapshot {
    #[serde(default)]
    pub products: Vec<CatalogProduct>,
    #[serde(default)]
    pub customers: Vec<CatalogCustomer>,
}

/// Which table a cached entity lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum CatalogKind {
    Product,
    Customer,
}

/// A cached entity together with the time its snapshot was fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct CachedEntity<T> {
    pub entity: T,
    #[ts(as = "String")]
    pub fetched_at: DateTime<Utc>,
}

/// Result of a local catalog lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct CatalogLookup {
    pub products: Vec<CachedEntity<CatalogProduct>>,
    pub customers: Vec<CachedEntity<CatalogCustomer>>,
}

impl CatalogLookup {
    pub fn is_empty(&self) -> bool {
        self.products.is_empty() && self.customers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.products.len() + self.customers.len()
    }
}

/// Counts and freshness of the cached snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct CacheSummary {
    pub products: i64,
    pub customers: i64,
    #[ts(as = "Option<String>")]
    pub fetched_at: Option<DateTime<Utc>>,
}
