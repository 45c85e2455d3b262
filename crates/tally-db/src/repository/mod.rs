//! # Repository Module
//!
//! Database repository implementations for the durable local store.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Repository Pattern                                   │
//! │                                                                         │
//! │  SaleQueue / SyncOrchestrator                                          │
//! │       │                                                                 │
//! │       │  db.pending_sales().mark_submitting(&id)                        │
//! │       ▼                                                                 │
//! │  PendingSaleRepository                                                 │
//! │  ├── insert(&self, local_id, payload, created_at)                      │
//! │  ├── list_pending(&self)                                               │
//! │  ├── mark_submitting / mark_confirmed / mark_rejected / mark_retry     │
//! │  └── delete_confirmed / delete_rejected                                │
//! │       │                                                                 │
//! │       │  One SQL statement per transition                              │
//! │       ▼                                                                 │
//! │  SQLite Database                                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`pending_sale::PendingSaleRepository`] - The offline sale queue
//! - [`catalog::CatalogRepository`] - Read-only catalog snapshot cache
//! - [`sync_meta::SyncMetaRepository`] - Persisted sync bookkeeping

pub mod catalog;
pub mod pending_sale;
pub mod sync_meta;
