//! # Catalog Cache Repository
//!
//! Read-only snapshot of server catalog data for offline lookups.
//!
//! ## Key Operations
//! - `replace_all`: wholesale replace in ONE transaction (no partial snapshot)
//! - `lookup`: local-only search, never touches the network
//! - `summary`: counts and freshness for diagnostics
//!
//! ## Replace Flow
//! ```text
//! BEGIN
//!   DELETE FROM catalog_products
//!   DELETE FROM catalog_customers
//!   INSERT ... (every product, fetched_at = T)
//!   INSERT ... (every customer, fetched_at = T)
//!   UPSERT sync_meta['catalog_fetched_at'] = T
//! COMMIT      ← readers see either the old snapshot or the new one
//! ```

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::error::DbResult;
use crate::repository::sync_meta::{SyncMetaRepository, CATALOG_FETCHED_AT};
use tally_core::{
    CacheSummary, CachedEntity, CatalogCustomer, CatalogLookup, CatalogProduct, CatalogSnapshot,
};

/// Default result cap for lookups.
pub const DEFAULT_LOOKUP_LIMIT: u32 = 50;

// =============================================================================
// Row Mapping
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct ProductRow {
    id: String,
    sku: String,
    barcode: Option<String>,
    name: String,
    price_cents: i64,
    tax_rate_bps: i64,
    is_active: bool,
    fetched_at: DateTime<Utc>,
}

impl From<ProductRow> for CachedEntity<CatalogProduct> {
    fn from(row: ProductRow) -> Self {
        CachedEntity {
            entity: CatalogProduct {
                id: row.id,
                sku: row.sku,
                barcode: row.barcode,
                name: row.name,
                price_cents: row.price_cents,
                tax_rate_bps: u32::try_from(row.tax_rate_bps).unwrap_or(0),
                is_active: row.is_active,
            },
            fetched_at: row.fetched_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CustomerRow {
    id: String,
    name: String,
    phone: Option<String>,
    email: Option<String>,
    fetched_at: DateTime<Utc>,
}

impl From<CustomerRow> for CachedEntity<CatalogCustomer> {
    fn from(row: CustomerRow) -> Self {
        CachedEntity {
            entity: CatalogCustomer {
                id: row.id,
                name: row.name,
                phone: row.phone,
                email: row.email,
            },
            fetched_at: row.fetched_at,
        }
    }
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for the catalog snapshot cache.
#[derive(Debug, Clone)]
pub struct CatalogRepository {
    pool: SqlitePool,
}

impl CatalogRepository {
    /// Creates a new CatalogRepository.
    pub fn new(pool: SqlitePool) -> Self {
        CatalogRepository { pool }
    }

    /// Replaces the cached snapshot wholesale.
    ///
    /// ## Arguments
    /// * `snapshot` - Full catalog as returned by the server
    /// * `fetched_at` - When the snapshot was fetched
    ///
    /// A failure anywhere rolls back to the previous snapshot.
    pub async fn replace_all(
        &self,
        snapshot: &CatalogSnapshot,
        fetched_at: DateTime<Utc>,
    ) -> DbResult<CacheSummary> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM catalog_products")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM catalog_customers")
            .execute(&mut *tx)
            .await?;

        for product in &snapshot.products {
            sqlx::query(
                r#"
                INSERT INTO catalog_products (
                    id, sku, barcode, name, price_cents, tax_rate_bps, is_active, fetched_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
            )
            .bind(&product.id)
            .bind(&product.sku)
            .bind(&product.barcode)
            .bind(&product.name)
            .bind(product.price_cents)
            .bind(i64::from(product.tax_rate_bps))
            .bind(product.is_active)
            .bind(fetched_at)
            .execute(&mut *tx)
            .await?;
        }

        for customer in &snapshot.customers {
            sqlx::query(
                r#"
                INSERT INTO catalog_customers (id, name, phone, email, fetched_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
            )
            .bind(&customer.id)
            .bind(&customer.name)
            .bind(&customer.phone)
            .bind(&customer.email)
            .bind(fetched_at)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO sync_meta (key, value, updated_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(CATALOG_FETCHED_AT)
        .bind(fetched_at.to_rfc3339())
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(
            products = snapshot.products.len(),
            customers = snapshot.customers.len(),
            "Catalog cache replaced"
        );

        Ok(CacheSummary {
            products: snapshot.products.len() as i64,
            customers: snapshot.customers.len() as i64,
            fetched_at: Some(fetched_at),
        })
    }

    /// Searches the cached catalog.
    ///
    /// ## Matching
    /// - exact id match, or
    /// - case-insensitive substring of product name / sku / barcode, or
    /// - case-insensitive substring of customer name / phone / email
    ///
    /// An empty query lists entries by name up to `limit` per kind.
    pub async fn lookup(&self, query: &str, limit: u32) -> DbResult<CatalogLookup> {
        let query = query.trim();
        let pattern = format!("%{}%", escape_like(query));

        debug!(query = %query, limit = %limit, "Catalog lookup");

        let products = sqlx::query_as::<_, ProductRow>(
            r#"
            SELECT * FROM catalog_products
            WHERE id = ?1
               OR name LIKE ?2 ESCAPE '\'
               OR sku LIKE ?2 ESCAPE '\'
               OR barcode LIKE ?2 ESCAPE '\'
            ORDER BY name
            LIMIT ?3
            "#,
        )
        .bind(query)
        .bind(&pattern)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let customers = sqlx::query_as::<_, CustomerRow>(
            r#"
            SELECT * FROM catalog_customers
            WHERE id = ?1
               OR name LIKE ?2 ESCAPE '\'
               OR phone LIKE ?2 ESCAPE '\'
               OR email LIKE ?2 ESCAPE '\'
            ORDER BY name
            LIMIT ?3
            "#,
        )
        .bind(query)
        .bind(&pattern)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(CatalogLookup {
            products: products.into_iter().map(CachedEntity::from).collect(),
            customers: customers.into_iter().map(CachedEntity::from).collect(),
        })
    }

    /// Gets a cached product by id.
    pub async fn get_product(&self, id: &str) -> DbResult<Option<CachedEntity<CatalogProduct>>> {
        let row = sqlx::query_as::<_, ProductRow>("SELECT * FROM catalog_products WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(CachedEntity::from))
    }

    /// Gets a cached customer by id.
    pub async fn get_customer(&self, id: &str) -> DbResult<Option<CachedEntity<CatalogCustomer>>> {
        let row = sqlx::query_as::<_, CustomerRow>("SELECT * FROM catalog_customers WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(CachedEntity::from))
    }

    /// Counts and fetch time of the current snapshot.
    pub async fn summary(&self) -> DbResult<CacheSummary> {
        let products: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM catalog_products")
            .fetch_one(&self.pool)
            .await?;
        let customers: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM catalog_customers")
            .fetch_one(&self.pool)
            .await?;
        let fetched_at = SyncMetaRepository::new(self.pool.clone())
            .get_time(CATALOG_FETCHED_AT)
            .await?;

        Ok(CacheSummary {
            products,
            customers,
            fetched_at,
        })
    }
}

/// Escapes LIKE wildcards so user input matches literally.
fn escape_like(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

// =============================================================================
// Unit Tests
// =============================================================================
