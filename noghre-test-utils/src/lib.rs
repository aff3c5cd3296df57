//! Noghre Test Utilities
//!
//! Shared test infrastructure for the Noghre workspace:
//! - Sample storefront entities implementing `Syncable`
//! - Scriptable mock remote client and payment gateway
//! - Proptest generators
//! - Fixtures and envelope assertions

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// Re-export core types for convenience
pub use noghre_core::{
    Amount, Authority, CachedRecord, EntityId, EntityType, ErrorKind, GatewayId, Identity,
    NoghreError, OrderId, Page, PageCursor, PaymentConfig, RecordSource, RemoteError,
    ResultEnvelope, SyncConfig, Syncable, Timestamp,
};
pub use noghre_payment::{PaymentGateway, PaymentRedirect, VerificationOutcome};
pub use noghre_sync::RemoteClient;

/// Install a test-friendly tracing subscriber honouring `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// SAMPLE ENTITIES
// ============================================================================

/// Catalog product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: EntityId,
    pub name: String,
    /// Price in rials.
    pub price: u64,
    pub in_stock: bool,
}

impl Product {
    pub fn new(id: u64, name: impl Into<String>, price: u64) -> Self {
        Self {
            id: EntityId::from(id),
            name: name.into(),
            price,
            in_stock: true,
        }
    }

    /// Same product with a different price.
    pub fn repriced(&self, price: u64) -> Self {
        Self {
            price,
            ..self.clone()
        }
    }
}

impl Syncable for Product {
    fn entity_type() -> EntityType {
        EntityType::Product
    }

    fn entity_id(&self) -> EntityId {
        self.id.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Paid,
    Shipped,
    Cancelled,
}

/// Storefront order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: EntityId,
    /// Total in rials.
    pub total: u64,
    pub status: OrderStatus,
}

impl Order {
    pub fn pending(id: &str, total: u64) -> Self {
        Self {
            id: EntityId::new(id),
            total,
            status: OrderStatus::Pending,
        }
    }

    pub fn with_status(&self, status: OrderStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }
}

impl Syncable for Order {
    fn entity_type() -> EntityType {
        EntityType::Order
    }

    fn entity_id(&self) -> EntityId {
        self.id.clone()
    }
}

// ============================================================================
// MOCK REMOTE CLIENT
// ============================================================================

#[derive(Debug, Default)]
struct RemoteScript {
    fail_next: VecDeque<RemoteError>,
    fail_always: Option<RemoteError>,
    delay_next: VecDeque<Duration>,
    delay: Option<Duration>,
}

impl RemoteScript {
    fn next_failure(&mut self) -> Option<RemoteError> {
        self.fail_next
            .pop_front()
            .or_else(|| self.fail_always.clone())
    }

    fn next_delay(&mut self) -> Option<Duration> {
        self.delay_next.pop_front().or(self.delay)
    }
}

/// Call counters of a [`MockRemoteClient`].
#[derive(Debug, Default)]
pub struct RemoteCalls {
    pub fetch: AtomicUsize,
    pub fetch_page: AtomicUsize,
    pub create: AtomicUsize,
    pub update: AtomicUsize,
    pub delete: AtomicUsize,
}

/// In-memory remote store with scripted failures and latency.
///
/// The outcome of a call (including the value it returns) is decided when
/// the call starts; a scripted delay only postpones delivery. A slow call
/// therefore returns the data as it was when the call was issued.
#[derive(Debug)]
pub struct MockRemoteClient<T> {
    records: Arc<RwLock<BTreeMap<EntityId, T>>>,
    pages: Arc<RwLock<HashMap<Option<PageCursor>, Page<T>>>>,
    script: Arc<Mutex<RemoteScript>>,
    calls: Arc<RemoteCalls>,
}

impl<T> Default for MockRemoteClient<T> {
    fn default() -> Self {
        Self {
            records: Arc::new(RwLock::new(BTreeMap::new())),
            pages: Arc::new(RwLock::new(HashMap::new())),
            script: Arc::new(Mutex::new(RemoteScript::default())),
            calls: Arc::new(RemoteCalls::default()),
        }
    }
}

impl<T: Syncable> MockRemoteClient<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a remote already holding `items`.
    pub fn with_records(items: impl IntoIterator<Item = T>) -> Self {
        let remote = Self::new();
        for item in items {
            remote.insert(item);
        }
        remote
    }

    /// Insert or replace a record on the remote.
    pub fn insert(&self, item: T) {
        self.records
            .write()
            .unwrap()
            .insert(item.entity_id(), item);
    }

    pub fn remove(&self, id: &EntityId) -> Option<T> {
        self.records.write().unwrap().remove(id)
    }

    pub fn record(&self, id: &EntityId) -> Option<T> {
        self.records.read().unwrap().get(id).cloned()
    }

    pub fn record_count(&self) -> usize {
        self.records.read().unwrap().len()
    }

    /// Serve `page` for `cursor` instead of deriving it from the records.
    pub fn set_page(&self, cursor: Option<PageCursor>, page: Page<T>) {
        self.pages.write().unwrap().insert(cursor, page);
    }

    /// Fail the next call with `error`. Queued failures are consumed in order.
    pub fn fail_next(&self, error: RemoteError) {
        self.script.lock().unwrap().fail_next.push_back(error);
    }

    /// Fail every call with `error` until [`recover`](Self::recover).
    pub fn fail_always(&self, error: RemoteError) {
        self.script.lock().unwrap().fail_always = Some(error);
    }

    /// Clear every scripted failure.
    pub fn recover(&self) {
        let mut script = self.script.lock().unwrap();
        script.fail_next.clear();
        script.fail_always = None;
    }

    /// Delay delivery of the next call's outcome.
    pub fn delay_next(&self, delay: Duration) {
        self.script.lock().unwrap().delay_next.push_back(delay);
    }

    /// Delay every call without a queued delay; `None` removes the delay.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.script.lock().unwrap().delay = delay;
    }

    pub fn calls(&self) -> &RemoteCalls {
        &self.calls
    }

    /// Total calls of every operation.
    pub fn total_calls(&self) -> usize {
        self.calls.fetch.load(Ordering::SeqCst)
            + self.calls.fetch_page.load(Ordering::SeqCst)
            + self.calls.create.load(Ordering::SeqCst)
            + self.calls.update.load(Ordering::SeqCst)
            + self.calls.delete.load(Ordering::SeqCst)
    }

    /// Decide the outcome of a call, then deliver it after any scripted delay.
    async fn respond<V>(
        &self,
        counter: &AtomicUsize,
        operation: &str,
        outcome: impl FnOnce() -> Result<V, RemoteError>,
    ) -> Result<V, RemoteError> {
        counter.fetch_add(1, Ordering::SeqCst);
        let (failure, delay) = {
            let mut script = self.script.lock().unwrap();
            (script.next_failure(), script.next_delay())
        };
        let result = match failure {
            Some(error) => {
                tracing::trace!(operation, error = %error, "Mock remote failing call");
                Err(error)
            }
            None => outcome(),
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        result
    }
}

#[async_trait]
impl<T: Syncable> RemoteClient<T> for MockRemoteClient<T> {
    async fn fetch(&self, id: &EntityId) -> Result<T, RemoteError> {
        self.respond(&self.calls.fetch, "fetch", || {
            self.record(id).ok_or_else(|| RemoteError::NotFound {
                id: id.to_string(),
            })
        })
        .await
    }

    async fn fetch_page(&self, cursor: Option<&PageCursor>) -> Result<Page<T>, RemoteError> {
        self.respond(&self.calls.fetch_page, "fetch_page", || {
            let scripted = self.pages.read().unwrap().get(&cursor.cloned()).cloned();
            match (scripted, cursor) {
                (Some(page), _) => Ok(page),
                (None, None) => Ok(Page::last(
                    self.records.read().unwrap().values().cloned().collect(),
                )),
                (None, Some(cursor)) => Err(RemoteError::NotFound {
                    id: cursor.to_string(),
                }),
            }
        })
        .await
    }

    async fn create(&self, entity: &T) -> Result<T, RemoteError> {
        self.respond(&self.calls.create, "create", || {
            self.insert(entity.clone());
            Ok(entity.clone())
        })
        .await
    }

    async fn update(&self, entity: &T) -> Result<T, RemoteError> {
        self.respond(&self.calls.update, "update", || {
            let id = entity.entity_id();
            let mut records = self.records.write().unwrap();
            match records.get_mut(&id) {
                Some(current) => {
                    *current = entity.clone();
                    Ok(entity.clone())
                }
                None => Err(RemoteError::NotFound { id: id.to_string() }),
            }
        })
        .await
    }

    async fn delete(&self, entity: &T) -> Result<T, RemoteError> {
        self.respond(&self.calls.delete, "delete", || {
            let id = entity.entity_id();
            self.remove(&id)
                .ok_or_else(|| RemoteError::NotFound { id: id.to_string() })
        })
        .await
    }
}

// ============================================================================
// MOCK PAYMENT GATEWAY
// ============================================================================

/// Scriptable payment gateway with ZarinPal-style authorities.
///
/// Verification returns queued outcomes first, then `Confirmed` with a
/// reference id derived from the authority.
#[derive(Debug, Default)]
pub struct MockPaymentGateway {
    next_authority: AtomicU64,
    request_failures: Mutex<VecDeque<RemoteError>>,
    outcomes: Mutex<VecDeque<Result<VerificationOutcome, RemoteError>>>,
    delay: Mutex<Option<Duration>>,
    request_calls: AtomicUsize,
    verify_calls: AtomicUsize,
}

impl MockPaymentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `request_payment` with `error`.
    pub fn fail_next_request(&self, error: RemoteError) {
        self.request_failures.lock().unwrap().push_back(error);
    }

    /// Queue the result of the next `verify_payment`.
    pub fn push_outcome(&self, outcome: Result<VerificationOutcome, RemoteError>) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    /// Delay every gateway call; `None` removes the delay.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn request_calls(&self) -> usize {
        self.request_calls.load(Ordering::SeqCst)
    }

    pub fn verify_calls(&self) -> usize {
        self.verify_calls.load(Ordering::SeqCst)
    }

    async fn pause(&self) {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl PaymentGateway for MockPaymentGateway {
    async fn request_payment(
        &self,
        _order_id: &OrderId,
        _amount: Amount,
        _gateway: &GatewayId,
    ) -> Result<PaymentRedirect, RemoteError> {
        self.request_calls.fetch_add(1, Ordering::SeqCst);
        let failure = self.request_failures.lock().unwrap().pop_front();
        self.pause().await;
        if let Some(error) = failure {
            return Err(error);
        }

        let serial = self.next_authority.fetch_add(1, Ordering::SeqCst) + 1;
        let authority = Authority::new(format!("A{serial:035}"));
        Ok(PaymentRedirect {
            redirect_url: format!("https://sandbox.zarinpal.com/pg/StartPay/{authority}"),
            authority,
        })
    }

    async fn verify_payment(
        &self,
        authority: &Authority,
        _amount: Amount,
    ) -> Result<VerificationOutcome, RemoteError> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self.outcomes.lock().unwrap().pop_front();
        self.pause().await;
        scripted.unwrap_or_else(|| {
            Ok(VerificationOutcome::Confirmed {
                ref_id: format!("ref-{authority}"),
            })
        })
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for Noghre types.

    use super::*;
    use chrono::{TimeZone, Utc};
    use proptest::collection::btree_map;
    use proptest::prelude::*;

    pub fn arb_entity_id() -> impl Strategy<Value = EntityId> {
        (1u64..10_000).prop_map(EntityId::from)
    }

    /// Timestamp within a few days of 2024-01-01, at millisecond precision.
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (0i64..(5 * 24 * 60 * 60 * 1000)).prop_map(|offset_ms| {
            Utc.timestamp_millis_opt(1_704_067_200_000 + offset_ms)
                .single()
                .unwrap_or_else(Utc::now)
        })
    }

    pub fn arb_entity_type() -> impl Strategy<Value = EntityType> {
        prop::sample::select(EntityType::ALL.to_vec())
    }

    pub fn arb_product() -> impl Strategy<Value = Product> {
        (1u64..10_000, "[a-z ]{1,24}", 1_000u64..50_000_000)
            .prop_map(|(id, name, price)| Product::new(id, name, price))
    }

    /// Products with distinct ids.
    pub fn arb_catalog(max: usize) -> impl Strategy<Value = Vec<Product>> {
        btree_map(1u64..10_000, ("[a-z]{1,12}", 1_000u64..50_000_000), 0..max).prop_map(|m| {
            m.into_iter()
                .map(|(id, (name, price))| Product::new(id, name, price))
                .collect()
        })
    }

    /// Errors that permit a stale local fallback.
    pub fn arb_transient_error() -> impl Strategy<Value = RemoteError> {
        prop_oneof![
            "[a-z ]{1,16}".prop_map(|reason| RemoteError::NetworkUnavailable { reason }),
            (1u64..60_000).prop_map(|after_ms| RemoteError::Timeout {
                operation: "fetch".to_string(),
                after_ms,
            }),
            (500u16..600).prop_map(|status| RemoteError::from_status(status, "server error")),
        ]
    }

    /// Errors the remote means definitively.
    pub fn arb_permanent_error() -> impl Strategy<Value = RemoteError> {
        prop_oneof![
            (400u16..500).prop_map(|status| RemoteError::from_status(status, "client error")),
            "[0-9]{1,6}".prop_map(|id| RemoteError::NotFound { id }),
            ("[a-z]{1,8}", "[a-z ]{1,16}")
                .prop_map(|(field, reason)| RemoteError::Validation { field, reason }),
            "[a-z ]{1,16}".prop_map(|reason| RemoteError::Unknown { reason }),
        ]
    }

    pub fn arb_identity() -> impl Strategy<Value = Identity> {
        "[a-z0-9]{4,16}".prop_map(Identity::new)
    }

    pub fn arb_authority() -> impl Strategy<Value = Authority> {
        "A[0-9]{35}".prop_map(Authority::new)
    }

    /// Definitive gateway answers.
    pub fn arb_terminal_outcome() -> impl Strategy<Value = VerificationOutcome> {
        prop_oneof![
            "[0-9]{6,10}".prop_map(|ref_id| VerificationOutcome::Confirmed { ref_id }),
            "[a-z ]{1,24}".prop_map(|reason| VerificationOutcome::Rejected { reason }),
        ]
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built values for common scenarios.

    use super::*;

    /// Sync configuration with a short remote timeout for paused-clock tests.
    pub fn fast_sync_config() -> SyncConfig {
        SyncConfig::default()
            .with_remote_timeout(Duration::from_millis(500))
            .with_observer_capacity(16)
    }

    /// Default payment policy: 5 attempts per 60 s, 300 s verification TTL.
    pub fn payment_config() -> PaymentConfig {
        PaymentConfig::default().with_gateway_timeout(Duration::from_secs(5))
    }

    /// Three products with ids 1..=3.
    pub fn catalog() -> Vec<Product> {
        vec![
            Product::new(1, "Silver ring", 1_200_000),
            Product::new(2, "Silver bangle", 3_400_000),
            Product::new(3, "Turquoise pendant", 5_900_000),
        ]
    }

    pub fn sample_order() -> Order {
        Order::pending("order-1001", 4_600_000)
    }

    pub fn network_down() -> RemoteError {
        RemoteError::NetworkUnavailable {
            reason: "connection refused".to_string(),
        }
    }

    pub fn server_error() -> RemoteError {
        RemoteError::from_status(503, "service unavailable")
    }

    pub fn unauthorized() -> RemoteError {
        RemoteError::from_status(401, "token expired")
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over result envelopes.

    use super::*;

    /// Assert a fresh success and return its value.
    #[track_caller]
    pub fn assert_fresh<T: std::fmt::Debug>(envelope: ResultEnvelope<T>) -> T {
        match envelope {
            ResultEnvelope::Success {
                value,
                stale: false,
            } => value,
            other => panic!("Expected fresh Success, got: {:?}", other),
        }
    }

    /// Assert a stale success and return its value.
    #[track_caller]
    pub fn assert_stale<T: std::fmt::Debug>(envelope: ResultEnvelope<T>) -> T {
        match envelope {
            ResultEnvelope::Success { value, stale: true } => value,
            other => panic!("Expected stale Success, got: {:?}", other),
        }
    }

    /// Assert an error of the given kind and return its cause.
    #[track_caller]
    pub fn assert_error_kind<T: std::fmt::Debug>(
        envelope: ResultEnvelope<T>,
        expected: ErrorKind,
    ) -> NoghreError {
        match envelope {
            ResultEnvelope::Error { kind, cause } => {
                assert_eq!(kind, expected, "Wrong error kind (cause: {cause})");
                cause
            }
            other => panic!("Expected Error({:?}), got: {:?}", expected, other),
        }
    }

    /// Assert that timestamps never decrease.
    #[track_caller]
    pub fn assert_non_decreasing(stamps: &[Timestamp]) {
        for pair in stamps.windows(2) {
            assert!(
                pair[0] <= pair[1],
                "fetched_at went backwards: {} then {}",
                pair[0],
                pair[1]
            );
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
