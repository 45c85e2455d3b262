//! In-process transaction server for tests.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::RemoteError;
use crate::remote::{CatalogRemote, ReachabilityProbe, SaleAccepted, SaleRemote};
use tally_core::{
    CatalogCustomer, CatalogProduct, CatalogSnapshot, PaymentMethod, SaleLine, SalePayload,
};

/// A valid one-line cash sale.
pub(crate) fn sample_payload() -> SalePayload {
    SalePayload {
        lines: vec![SaleLine {
            product_id: "p-1".to_string(),
            sku: "COKE-330".to_string(),
            name: "Coca-Cola 330ml".to_string(),
            unit_price_cents: 250,
            quantity: 2,
            discount_cents: 0,
        }],
        payment_method: PaymentMethod::Cash,
        amount_paid_cents: 500,
        subtotal_cents: 500,
        discount_cents: 0,
        tax_cents: 0,
        total_cents: 500,
        customer_id: None,
        cashier_id: "cashier-1".to_string(),
        device_id: "till-1".to_string(),
        sold_at: Utc::now(),
    }
}

pub(crate) fn sample_catalog() -> CatalogSnapshot {
    CatalogSnapshot {
        products: vec![
            CatalogProduct {
                id: "p-1".to_string(),
                sku: "COKE-330".to_string(),
                barcode: Some("5449000000996".to_string()),
                name: "Coca-Cola 330ml".to_string(),
                price_cents: 250,
                tax_rate_bps: 0,
                is_active: true,
            },
            CatalogProduct {
                id: "p-2".to_string(),
                sku: "BREAD-WHT".to_string(),
                barcode: None,
                name: "White Bread".to_string(),
                price_cents: 180,
                tax_rate_bps: 0,
                is_active: true,
            },
        ],
        customers: vec![CatalogCustomer {
            id: "c-1".to_string(),
            name: "Ayesha Khan".to_string(),
            phone: Some("0300-1234567".to_string()),
            email: None,
        }],
    }
}

type CallHook = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct FakeState {
    /// Idempotency keys in call order.
    calls: Vec<String>,
    /// Errors returned by the next calls, before normal handling.
    script: VecDeque<RemoteError>,
    /// Keys answered with a permanent error.
    reject: HashMap<String, String>,
    /// Key → server id for every sale the server holds.
    accepted: HashMap<String, String>,
    /// Store the next new sale but answer with a transient error.
    lose_next_confirmation: bool,
    catalog: CatalogSnapshot,
    catalog_error: Option<RemoteError>,
    catalog_fetches: usize,
    after_call: Option<CallHook>,
}

/// Scriptable fake implementing every remote trait.
///
/// Deduplicates on the idempotency key like the real server.
pub(crate) struct FakeServer {
    state: Mutex<FakeState>,
    reachable: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

impl FakeServer {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(FakeServer {
            state: Mutex::new(FakeState {
                catalog: sample_catalog(),
                ..Default::default()
            }),
            reachable: AtomicBool::new(true),
            delay: Mutex::new(None),
        })
    }

    /// Queues transient failures answered before anything else.
    pub(crate) fn fail_next(&self, errors: impl IntoIterator<Item = RemoteError>) {
        self.state.lock().unwrap().script.extend(errors);
    }

    pub(crate) fn reject(&self, key: &str, reason: &str) {
        self.state
            .lock()
            .unwrap()
            .reject
            .insert(key.to_string(), reason.to_string());
    }

    pub(crate) fn lose_next_confirmation(&self) {
        self.state.lock().unwrap().lose_next_confirmation = true;
    }

    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub(crate) fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub(crate) fn set_catalog(&self, catalog: CatalogSnapshot) {
        self.state.lock().unwrap().catalog = catalog;
    }

    pub(crate) fn fail_catalog(&self, error: Option<RemoteError>) {
        self.state.lock().unwrap().catalog_error = error;
    }

    pub(crate) fn after_call(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        self.state.lock().unwrap().after_call = Some(Arc::new(hook));
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Distinct sales the server has created.
    pub(crate) fn created(&self) -> usize {
        self.state.lock().unwrap().accepted.len()
    }

    pub(crate) fn catalog_fetches(&self) -> usize {
        self.state.lock().unwrap().catalog_fetches
    }

    fn handle(&self, key: &str) -> Result<SaleAccepted, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(key.to_string());

        if let Some(err) = state.script.pop_front() {
            return Err(err);
        }

        if let Some(reason) = state.reject.get(key) {
            return Err(RemoteError::from_status(422, reason.clone()));
        }

        if let Some(server_id) = state.accepted.get(key) {
            return Ok(SaleAccepted {
                server_id: server_id.clone(),
            });
        }

        let server_id = format!("srv-{}", state.accepted.len() + 1);
        state.accepted.insert(key.to_string(), server_id.clone());

        if state.lose_next_confirmation {
            state.lose_next_confirmation = false;
            return Err(RemoteError::transient("connection reset"));
        }

        Ok(SaleAccepted { server_id })
    }
}

#[async_trait]
impl SaleRemote for FakeServer {
    async fn create_sale(
        &self,
        idempotency_key: &str,
        _payload: &SalePayload,
    ) -> Result<SaleAccepted, RemoteError> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let result = self.handle(idempotency_key);

        let hook = self.state.lock().unwrap().after_call.clone();
        if let Some(hook) = hook {
            hook(idempotency_key);
        }

        result
    }
}

#[async_trait]
impl CatalogRemote for FakeServer {
    async fn fetch_catalog(&self) -> Result<CatalogSnapshot, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.catalog_fetches += 1;
        match &state.catalog_error {
            Some(err) => Err(err.clone()),
            None => Ok(state.catalog.clone()),
        }
    }
}

#[async_trait]
impl ReachabilityProbe for FakeServer {
    async fn probe(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}
