use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use noghre_core::{EntityId, ErrorKind, Page, PageCursor, SyncConfig};
use noghre_sync::{InMemoryLocalStore, LmdbLocalStore, LocalStore, Mutation, SyncCoordinator};
use noghre_test_utils::assertions::{assert_error_kind, assert_fresh, assert_stale};
use noghre_test_utils::{fixtures, init_tracing, MockRemoteClient, Order, OrderStatus, Product};

type Coordinator = SyncCoordinator<Product, MockRemoteClient<Product>, InMemoryLocalStore>;

fn setup(
    items: Vec<Product>,
) -> (
    Arc<MockRemoteClient<Product>>,
    Arc<InMemoryLocalStore>,
    Arc<Coordinator>,
) {
    init_tracing();
    let remote = Arc::new(MockRemoteClient::with_records(items));
    let store = Arc::new(InMemoryLocalStore::new());
    let coordinator = Arc::new(SyncCoordinator::new(
        Arc::clone(&remote),
        Arc::clone(&store),
        fixtures::fast_sync_config(),
    ));
    (remote, store, coordinator)
}

fn id(raw: u64) -> EntityId {
    EntityId::from(raw)
}

// ============================================================================
// READS
// ============================================================================

#[tokio::test(start_paused = true)]
async fn get_caches_remote_value() {
    let (remote, store, coordinator) = setup(fixtures::catalog());

    let record = assert_fresh(coordinator.get(&id(1)).await);
    assert_eq!(record.value.name, "Silver ring");

    let cached = store
        .get::<Product>(&id(1))
        .await
        .expect("get should succeed")
        .expect("record should be cached");
    assert_eq!(cached, record);
    assert_eq!(remote.calls().fetch.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn transient_failure_serves_stale_record() {
    let (remote, _store, coordinator) = setup(fixtures::catalog());
    let fresh = assert_fresh(coordinator.get(&id(2)).await);

    remote.fail_next(fixtures::network_down());
    let stale = assert_stale(coordinator.get(&id(2)).await);
    assert_eq!(stale, fresh);

    remote.fail_next(fixtures::server_error());
    assert_stale(coordinator.get(&id(2)).await);
}

#[tokio::test(start_paused = true)]
async fn timeout_serves_stale_record() {
    let (remote, _store, coordinator) = setup(fixtures::catalog());
    let fresh = assert_fresh(coordinator.get(&id(3)).await);

    // Longer than the 500ms remote timeout.
    remote.set_delay(Some(Duration::from_secs(10)));
    let stale = assert_stale(coordinator.get(&id(3)).await);
    assert_eq!(stale.value, fresh.value);
    assert_eq!(stale.fetched_at, fresh.fetched_at);
}

#[tokio::test(start_paused = true)]
async fn transient_failure_without_cache_keeps_kind() {
    let (remote, _store, coordinator) = setup(fixtures::catalog());

    remote.fail_next(fixtures::network_down());
    assert_error_kind(coordinator.get(&id(1)).await, ErrorKind::NetworkUnavailable);

    remote.set_delay(Some(Duration::from_secs(10)));
    assert_error_kind(coordinator.get(&id(1)).await, ErrorKind::Timeout);
}

#[tokio::test(start_paused = true)]
async fn permanent_failure_is_not_masked_by_cache() {
    let (remote, _store, coordinator) = setup(fixtures::catalog());
    assert_fresh(coordinator.get(&id(1)).await);

    remote.fail_next(fixtures::unauthorized());
    assert_error_kind(coordinator.get(&id(1)).await, ErrorKind::Unauthorized);

    remote.remove(&id(1));
    assert_error_kind(coordinator.get(&id(1)).await, ErrorKind::NotFound);

    remote.fail_next(noghre_core::RemoteError::Validation {
        field: "id".to_string(),
        reason: "malformed".to_string(),
    });
    assert_error_kind(coordinator.get(&id(1)).await, ErrorKind::ValidationError);
}

#[tokio::test(start_paused = true)]
async fn late_older_response_is_discarded() {
    let (remote, store, coordinator) = setup(vec![Product::new(1, "Ring", 1_000)]);

    // The first fetch sees price 1000 but is delivered late.
    remote.delay_next(Duration::from_millis(200));
    let slow = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.get(&id(1)).await })
    };
    tokio::task::yield_now().await;

    // Keep the wall-clock stamps of the two requests apart.
    std::thread::sleep(Duration::from_millis(2));
    remote.insert(Product::new(1, "Ring", 2_000));
    let newer = assert_fresh(coordinator.get(&id(1)).await);
    assert_eq!(newer.value.price, 2_000);

    let late = assert_fresh(slow.await.expect("slow fetch should join"));
    assert_eq!(late.value.price, 2_000);

    let stored = store
        .get::<Product>(&id(1))
        .await
        .expect("get should succeed")
        .expect("record should be cached");
    assert_eq!(stored.value.price, 2_000);
    assert_eq!(stored.fetched_at, newer.fetched_at);
    let stats = store.stats().await.expect("stats should succeed");
    assert_eq!(stats.rejected_writes, 1);
}

// ============================================================================
// PAGES
// ============================================================================

#[tokio::test(start_paused = true)]
async fn pages_merge_and_fall_back_per_cursor() {
    let (remote, store, coordinator) = setup(Vec::new());
    let second = PageCursor::new("p2");
    remote.set_page(
        None,
        Page::new(
            vec![Product::new(1, "Ring", 100), Product::new(2, "Bangle", 200)],
            Some(second.clone()),
        ),
    );
    remote.set_page(
        Some(second.clone()),
        Page::last(vec![Product::new(2, "Bangle", 250), Product::new(3, "Pendant", 300)]),
    );

    let first_page = assert_fresh(coordinator.list(None).await);
    assert_eq!(first_page.items.len(), 2);
    assert_eq!(first_page.next_cursor, Some(second.clone()));

    let second_page = assert_fresh(coordinator.list(Some(&second)).await);
    assert_eq!(second_page.items.len(), 2);
    assert!(second_page.next_cursor.is_none());

    // Product 2 appears on both pages and is stored once with the newer value.
    assert_eq!(store.len(), 3);
    let merged = store
        .get::<Product>(&id(2))
        .await
        .expect("get should succeed")
        .expect("record should be cached");
    assert_eq!(merged.value.price, 250);

    remote.fail_always(fixtures::network_down());

    let offline_first = assert_stale(coordinator.list(None).await);
    let ids: Vec<_> = offline_first.items.iter().map(|r| r.value.id.clone()).collect();
    assert_eq!(ids, vec![id(1), id(2)]);
    assert_eq!(offline_first.items[1].value.price, 250);
    assert_eq!(offline_first.next_cursor, Some(second.clone()));

    let offline_second = assert_stale(coordinator.list(Some(&second)).await);
    assert_eq!(offline_second.items.len(), 2);

    let unknown = coordinator.list(Some(&PageCursor::new("p9"))).await;
    assert_error_kind(unknown, ErrorKind::NetworkUnavailable);
}

#[tokio::test(start_paused = true)]
async fn offline_first_page_without_manifest_lists_cache() {
    let (remote, _store, coordinator) = setup(fixtures::catalog());
    assert_fresh(coordinator.get(&id(3)).await);
    assert_fresh(coordinator.get(&id(1)).await);

    remote.fail_always(fixtures::server_error());
    let page = assert_stale(coordinator.list(None).await);
    let ids: Vec<_> = page.items.iter().map(|r| r.value.id.clone()).collect();
    assert_eq!(ids, vec![id(1), id(3)]);
    assert!(page.next_cursor.is_none());
}

#[tokio::test(start_paused = true)]
async fn offline_first_page_with_empty_cache_is_an_error() {
    let (remote, _store, coordinator) = setup(fixtures::catalog());
    remote.fail_always(fixtures::network_down());
    assert_error_kind(coordinator.list(None).await, ErrorKind::NetworkUnavailable);
}

// ============================================================================
// MUTATIONS
// ============================================================================

#[tokio::test(start_paused = true)]
async fn failed_update_leaves_store_unchanged() {
    let (remote, store, coordinator) = setup(fixtures::catalog());
    let before = assert_fresh(coordinator.get(&id(1)).await);

    remote.fail_next(fixtures::server_error());
    let result = coordinator
        .mutate(Mutation::Update(before.value.repriced(9_999)))
        .await;
    assert_error_kind(result, ErrorKind::ServerError);

    let after = store
        .get::<Product>(&id(1))
        .await
        .expect("get should succeed")
        .expect("record should be cached");
    assert_eq!(after, before);
    assert_eq!(
        remote.record(&id(1)).map(|p| p.price),
        Some(before.value.price)
    );
}

#[tokio::test(start_paused = true)]
async fn confirmed_mutations_reach_the_store() {
    let (remote, store, coordinator) = setup(fixtures::catalog());

    let created = assert_fresh(
        coordinator
            .mutate(Mutation::Create(Product::new(10, "Anklet", 700)))
            .await,
    );
    assert_eq!(created.value.id, id(10));
    assert!(store
        .get::<Product>(&id(10))
        .await
        .expect("get should succeed")
        .is_some());

    let updated = assert_fresh(
        coordinator
            .mutate(Mutation::Update(created.value.repriced(800)))
            .await,
    );
    assert!(updated.fetched_at >= created.fetched_at);
    assert_eq!(remote.record(&id(10)).map(|p| p.price), Some(800));

    assert_fresh(coordinator.mutate(Mutation::Delete(updated.value)).await);
    assert!(store
        .get::<Product>(&id(10))
        .await
        .expect("get should succeed")
        .is_none());
    assert!(remote.record(&id(10)).is_none());
}

#[tokio::test(start_paused = true)]
async fn read_overtaken_by_delete_does_not_restore_record() {
    let (remote, store, coordinator) = setup(vec![Product::new(1, "Ring", 1_000)]);
    assert_fresh(coordinator.get(&id(1)).await);

    // This read sees the product but is delivered after the delete.
    remote.delay_next(Duration::from_millis(200));
    let slow = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.get(&id(1)).await })
    };
    tokio::task::yield_now().await;

    std::thread::sleep(Duration::from_millis(2));
    assert_fresh(
        coordinator
            .mutate(Mutation::Delete(Product::new(1, "Ring", 1_000)))
            .await,
    );

    let late = slow.await.expect("slow fetch should join");
    assert_error_kind(late, ErrorKind::NotFound);
    assert!(store
        .get::<Product>(&id(1))
        .await
        .expect("get should succeed")
        .is_none());
    assert!(store.is_empty());

    remote.fail_next(fixtures::network_down());
    assert_error_kind(coordinator.get(&id(1)).await, ErrorKind::NetworkUnavailable);
}

#[tokio::test(start_paused = true)]
async fn update_returns_confirmed_record_when_store_is_newer() {
    let (remote, store, coordinator) = setup(vec![Product::new(1, "Ring", 1_000)]);
    let before = assert_fresh(coordinator.get(&id(1)).await);

    // The update is confirmed remotely but its response arrives late.
    remote.delay_next(Duration::from_millis(200));
    let slow = {
        let coordinator = Arc::clone(&coordinator);
        let update = before.value.repriced(1_200);
        tokio::spawn(async move { coordinator.mutate(Mutation::Update(update)).await })
    };
    tokio::task::yield_now().await;

    // Meanwhile a later read stores a newer remote value.
    std::thread::sleep(Duration::from_millis(2));
    remote.insert(Product::new(1, "Ring", 1_500));
    let newer = assert_fresh(coordinator.get(&id(1)).await);

    let confirmed = assert_fresh(slow.await.expect("slow update should join"));
    assert_eq!(confirmed.value.price, 1_200);
    assert!(confirmed.fetched_at < newer.fetched_at);

    let stored = store
        .get::<Product>(&id(1))
        .await
        .expect("get should succeed")
        .expect("record should be cached");
    assert_eq!(stored, newer);
}

#[tokio::test(start_paused = true)]
async fn mutation_timeout_leaves_store_unchanged() {
    let (remote, store, coordinator) = setup(Vec::new());
    remote.delay_next(Duration::from_secs(5));

    let result = coordinator
        .mutate(Mutation::Create(Product::new(4, "Brooch", 400)))
        .await;
    assert_error_kind(result, ErrorKind::Timeout);
    assert!(store.is_empty());
}

#[tokio::test(start_paused = true)]
async fn orders_sync_through_the_same_store() {
    init_tracing();
    let orders = Arc::new(MockRemoteClient::with_records(vec![fixtures::sample_order()]));
    let products = Arc::new(MockRemoteClient::with_records(fixtures::catalog()));
    let store = Arc::new(InMemoryLocalStore::new());
    let config = fixtures::fast_sync_config();

    let order_sync: SyncCoordinator<Order, _, _> =
        SyncCoordinator::new(Arc::clone(&orders), Arc::clone(&store), config.clone());
    let product_sync: SyncCoordinator<Product, _, _> =
        SyncCoordinator::new(Arc::clone(&products), Arc::clone(&store), config);

    let order_id = fixtures::sample_order().id;
    assert_fresh(order_sync.get(&order_id).await);
    assert_fresh(product_sync.get(&id(1)).await);
    assert_eq!(store.len(), 2);

    let paid = fixtures::sample_order().with_status(OrderStatus::Paid);
    let confirmed = assert_fresh(order_sync.mutate(Mutation::Update(paid)).await);
    assert_eq!(confirmed.value.status, OrderStatus::Paid);

    assert_eq!(order_sync.invalidate_all().await.expect("invalidate should succeed"), 1);
    assert!(store
        .get::<Order>(&order_id)
        .await
        .expect("get should succeed")
        .is_none());
    assert_eq!(store.len(), 1);
}

// ============================================================================
// OBSERVATION
// ============================================================================

#[tokio::test(start_paused = true)]
async fn observe_yields_current_then_newer_records() {
    let (remote, _store, coordinator) = setup(fixtures::catalog());
    let first = assert_fresh(coordinator.get(&id(1)).await);

    let mut stream = Box::pin(coordinator.observe(&id(1)));
    assert_eq!(coordinator.observer_count(&id(1)), 1);
    let initial = stream.next().await.expect("stream should yield current record");
    assert_eq!(initial, first);

    std::thread::sleep(Duration::from_millis(2));
    remote.insert(Product::new(1, "Silver ring", 1_500_000));
    let second = assert_fresh(coordinator.get(&id(1)).await);

    let observed = stream.next().await.expect("stream should yield update");
    assert_eq!(observed, second);
    assert!(observed.fetched_at > initial.fetched_at);

    // A stale fallback publishes nothing.
    remote.fail_next(fixtures::network_down());
    assert_stale(coordinator.get(&id(1)).await);
    let quiet = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
    assert!(quiet.is_err());

    drop(stream);
    assert_eq!(coordinator.observer_count(&id(1)), 0);
}

#[tokio::test(start_paused = true)]
async fn observe_unknown_id_waits_for_first_commit() {
    let (remote, _store, coordinator) = setup(Vec::new());
    let mut stream = Box::pin(coordinator.observe(&id(5)));

    let pending = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
    assert!(pending.is_err());

    remote.insert(Product::new(5, "Cufflinks", 900));
    let committed = assert_fresh(coordinator.get(&id(5)).await);
    let observed = stream.next().await.expect("stream should yield first commit");
    assert_eq!(observed, committed);
}

#[tokio::test(start_paused = true)]
async fn dropped_observers_release_their_channel() {
    let (_remote, _store, coordinator) = setup(Vec::new());

    let first = coordinator.observe(&id(7));
    let second = coordinator.observe(&id(7));
    let other = coordinator.observe(&id(8));
    assert_eq!(coordinator.observed_ids(), 2);
    assert_eq!(coordinator.observer_count(&id(7)), 2);

    drop(first);
    assert_eq!(coordinator.observed_ids(), 2);
    assert_eq!(coordinator.observer_count(&id(7)), 1);

    // No commit ever reaches these ids; dropping is enough to prune.
    drop(second);
    drop(other);
    assert_eq!(coordinator.observed_ids(), 0);
    assert_eq!(coordinator.observer_count(&id(7)), 0);
}

#[tokio::test(start_paused = true)]
async fn invalidate_forces_error_when_offline() {
    let (remote, _store, coordinator) = setup(fixtures::catalog());
    assert_fresh(coordinator.get(&id(2)).await);

    assert!(coordinator.invalidate(&id(2)).await.expect("invalidate should succeed"));
    assert!(!coordinator.invalidate(&id(2)).await.expect("invalidate should succeed"));

    remote.fail_next(fixtures::network_down());
    assert_error_kind(coordinator.get(&id(2)).await, ErrorKind::NetworkUnavailable);
}

// ============================================================================
// DURABLE STORE
// ============================================================================

#[tokio::test(start_paused = true)]
async fn lmdb_cache_survives_restart() {
    init_tracing();
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let remote = Arc::new(MockRemoteClient::with_records(fixtures::catalog()));

    let fresh = {
        let store = Arc::new(LmdbLocalStore::new(dir.path(), 16).expect("store should open"));
        let coordinator: SyncCoordinator<Product, _, _> =
            SyncCoordinator::new(Arc::clone(&remote), store, SyncConfig::default());
        assert_fresh(coordinator.get(&id(1)).await)
    };

    let store = Arc::new(LmdbLocalStore::new(dir.path(), 16).expect("store should reopen"));
    let coordinator: SyncCoordinator<Product, _, _> =
        SyncCoordinator::new(Arc::clone(&remote), store, fixtures::fast_sync_config());
    remote.fail_always(fixtures::network_down());

    // The durable store keeps microsecond precision.
    let stale = assert_stale(coordinator.get(&id(1)).await);
    assert_eq!(stale.value, fresh.value);
    assert_eq!(
        stale.fetched_at.timestamp_micros(),
        fresh.fetched_at.timestamp_micros()
    );
}
