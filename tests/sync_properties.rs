//! Cache-wide guarantees: dedup, exact rollback, tag fan-out and
//! re-subscription.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};

use marketsync::marketplace::models::{AddToCart, ProductFilter};
use marketsync::marketplace::{MarketplaceApi, MarketplaceBackend, Observed, names};
use marketsync::sync::{
    ApiError, CacheKey, MutationEndpoint, MutationHandle, QueryEndpoint, QueryHandle, QueryStatus,
    SyncClient, SyncConfig, Tag, TagKind,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Profile {
    name: String,
    theme: String,
}

#[derive(Debug, Clone)]
struct Edit {
    value: String,
    delay_ms: u64,
    fail: bool,
}

impl Edit {
    fn new(value: &str, delay_ms: u64, fail: bool) -> Self {
        Self {
            value: value.to_string(),
            delay_ms,
            fail,
        }
    }
}

async fn settle_edit(edit: Edit) -> Result<(), ApiError> {
    tokio::time::sleep(Duration::from_millis(edit.delay_ms)).await;
    if edit.fail {
        Err(ApiError::status(500, "rejected"))
    } else {
        Ok(())
    }
}

struct ProfileFixture {
    client: SyncClient,
    profile: QueryHandle<(), Profile>,
    rename: MutationHandle<Edit, ()>,
    retheme: MutationHandle<Edit, ()>,
}

fn profile_fixture() -> ProfileFixture {
    let client = SyncClient::new(SyncConfig::default());
    let profile = client
        .register_query(
            QueryEndpoint::new("profile", |_: ()| async {
                Ok::<_, ApiError>(Profile {
                    name: "ana".to_string(),
                    theme: "light".to_string(),
                })
            }),
        )
        .expect("query registers");

    let view = profile.clone();
    let rename = client
        .register_mutation(
            MutationEndpoint::new("rename", settle_edit).optimistic(move |edit: &Edit, draft| {
                draft.update_query(&view, &(), |profile: &mut Profile| {
                    profile.name = edit.value.clone();
                });
            }),
        )
        .expect("mutation registers");

    let view = profile.clone();
    let retheme = client
        .register_mutation(
            MutationEndpoint::new("retheme", settle_edit).optimistic(move |edit: &Edit, draft| {
                draft.update_query(&view, &(), |profile: &mut Profile| {
                    profile.theme = edit.value.clone();
                });
            }),
        )
        .expect("mutation registers");

    ProfileFixture {
        client,
        profile,
        rename,
        retheme,
    }
}

fn cached_profile(fixture: &ProfileFixture) -> Profile {
    fixture
        .client
        .get_snapshot(&fixture.profile, &())
        .expect("snapshot")
        .decode::<Profile>()
        .expect("decodes")
        .expect("cached")
}

fn marketplace() -> (SyncClient, MarketplaceBackend, MarketplaceApi) {
    marketplace_with(SyncConfig::default())
}

/// Unwatched entries stay cached for a minute instead of being released.
fn retaining_marketplace() -> (SyncClient, MarketplaceBackend, MarketplaceApi) {
    marketplace_with(SyncConfig {
        keep_unused_data_for_ms: 60_000,
        ..SyncConfig::default()
    })
}

fn marketplace_with(config: SyncConfig) -> (SyncClient, MarketplaceBackend, MarketplaceApi) {
    let client = SyncClient::new(config);
    let backend = MarketplaceBackend::seeded(Duration::from_millis(50));
    let api = MarketplaceApi::register(&client, &backend).expect("endpoints register");
    (client, backend, api)
}

// ============================================================================
// Dedup
// ============================================================================

#[tokio::test(start_paused = true)]
async fn concurrent_identical_resolves_fetch_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let client = SyncClient::default();
    let handle = client
        .register_query(QueryEndpoint::new("stock", move |sku: String| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(Duration::from_millis(80)).await;
                Ok::<_, ApiError>(format!("{sku}:7"))
            }
        }))
        .expect("registers");

    let sku = "p1".to_string();
    let results = join_all((0..8).map(|_| client.resolve(&handle, &sku))).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(
        results
            .iter()
            .all(|result| matches!(result.as_deref(), Ok("p1:7")))
    );

    client.resolve(&handle, &"p2".to_string()).await.expect("p2");
    assert_eq!(calls.load(Ordering::SeqCst), 2, "other params use another key");
}

#[tokio::test(start_paused = true)]
async fn subscribers_and_resolvers_share_the_fetch() {
    let (client, backend, api) = marketplace();
    let filter = ProductFilter::category("garden");

    let _first = client
        .subscribe(&api.products, &filter, |_| {})
        .expect("subscribed");
    let _second = client
        .subscribe(&api.products, &filter, |_| {})
        .expect("subscribed");
    let (a, b) = tokio::join!(
        client.resolve(&api.products, &filter),
        client.resolve(&api.products, &filter),
    );

    assert_eq!(a.expect("products"), b.expect("products"));
    assert_eq!(backend.calls(names::PRODUCTS), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_fetch_is_shared_and_recorded_as_error() {
    let (client, backend, api) = retaining_marketplace();
    backend.reject_next(names::SERVICES, ApiError::status(503, "maintenance"));

    let (a, b) = tokio::join!(
        client.resolve(&api.services, &()),
        client.resolve(&api.services, &()),
    );
    assert!(a.is_err() && b.is_err());
    assert_eq!(backend.calls(names::SERVICES), 1);

    let snapshot = client.get_snapshot(&api.services, &()).expect("snapshot");
    assert_eq!(snapshot.status, QueryStatus::Error);

    let services = client
        .resolve(&api.services, &())
        .await
        .expect("retry succeeds");
    assert_eq!(services.len(), 2);
}

// ============================================================================
// Rollback
// ============================================================================

#[tokio::test(start_paused = true)]
async fn failed_patch_restores_only_its_own_paths() {
    let fixture = profile_fixture();
    let seen = Observed::<Profile>::new();
    let _sub = fixture
        .client
        .subscribe(&fixture.profile, &(), seen.callback())
        .expect("subscribed");
    fixture
        .client
        .resolve(&fixture.profile, &())
        .await
        .expect("profile loads");

    let (renamed, rethemed) = tokio::join!(
        fixture
            .client
            .mutate(&fixture.rename, Edit::new("bob", 100, true)),
        fixture
            .client
            .mutate(&fixture.retheme, Edit::new("dark", 300, false)),
    );
    assert!(renamed.is_err());
    assert!(rethemed.is_ok());

    let pairs: Vec<(String, String)> = seen
        .values()
        .into_iter()
        .map(|profile| (profile.name, profile.theme))
        .collect();
    let pair = |name: &str, theme: &str| (name.to_string(), theme.to_string());
    assert_eq!(
        pairs,
        vec![
            pair("ana", "light"),
            pair("bob", "light"),
            pair("bob", "dark"),
            pair("ana", "dark"),
        ]
    );
    assert_eq!(
        cached_profile(&fixture),
        Profile {
            name: "ana".to_string(),
            theme: "dark".to_string(),
        }
    );
}

#[tokio::test(start_paused = true)]
async fn overlapping_failures_unwind_to_the_original_in_either_order() {
    for (first_ms, second_ms) in [(300, 100), (100, 300)] {
        let fixture = profile_fixture();
        let _sub = fixture
            .client
            .subscribe(&fixture.profile, &(), |_| {})
            .expect("subscribed");
        fixture
            .client
            .resolve(&fixture.profile, &())
            .await
            .expect("profile loads");
        let key = fixture.profile.cache_key(&()).expect("key");
        let original = fixture.client.cached_value(&key).expect("cached");

        let (first, second) = tokio::join!(
            fixture
                .client
                .mutate(&fixture.rename, Edit::new("bob", first_ms, true)),
            fixture
                .client
                .mutate(&fixture.rename, Edit::new("cat", second_ms, true)),
        );
        assert!(first.is_err() && second.is_err());
        assert_eq!(
            fixture.client.cached_value(&key),
            Some(original),
            "order {first_ms}/{second_ms}"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn mutation_without_cached_view_skips_the_patch() {
    let (client, backend, api) = marketplace();
    let cart = client
        .mutate(
            &api.add_to_cart,
            AddToCart {
                product_id: "p3".to_string(),
                name: "Notebook".to_string(),
                price: 300,
            },
        )
        .await
        .expect("added");

    assert_eq!(cart.total, 300);
    assert_eq!(backend.calls(names::CART), 0, "nothing cached, nothing refetched");
    assert!(client.cached_keys().is_empty());
}

// ============================================================================
// Tag fan-out
// ============================================================================

#[tokio::test(start_paused = true)]
async fn cart_tag_reaches_exactly_the_cart_views() {
    let (client, backend, api) = marketplace();
    let _cart = client.subscribe(&api.cart, &(), |_| {}).expect("subscribed");
    let _wishlist = client
        .subscribe(&api.wishlist, &(), |_| {})
        .expect("subscribed");
    let _catalog = client
        .subscribe(&api.products, &ProductFilter::all(), |_| {})
        .expect("subscribed");
    let _feed = client
        .subscribe(&api.notifications, &(), |_| {})
        .expect("subscribed");
    client.resolve(&api.cart, &()).await.expect("cart");
    client.resolve(&api.wishlist, &()).await.expect("wishlist");
    client
        .resolve(&api.products, &ProductFilter::all())
        .await
        .expect("products");
    client.resolve(&api.notifications, &()).await.expect("feed");

    let plan = client.invalidate_tags(&[Tag::kind(TagKind::Cart)]).await;
    let refetched: Vec<CacheKey> = plan.refetch.iter().cloned().collect();
    assert_eq!(refetched, vec![api.cart.cache_key(&()).expect("key")]);
    assert!(plan.stale_only.is_empty());

    assert_eq!(backend.calls(names::CART), 2);
    assert_eq!(backend.calls(names::WISHLIST), 1);
    assert_eq!(backend.calls(names::PRODUCTS), 1);
    assert_eq!(backend.calls(names::NOTIFICATIONS), 1);
}

#[tokio::test(start_paused = true)]
async fn id_tag_matches_only_that_item_and_family_lists() {
    let (client, backend, api) = marketplace();
    let p1 = "p1".to_string();
    let p3 = "p3".to_string();
    let _lamp = client.subscribe(&api.product, &p1, |_| {}).expect("subscribed");
    let _notebook = client.subscribe(&api.product, &p3, |_| {}).expect("subscribed");
    let _catalog = client
        .subscribe(&api.products, &ProductFilter::all(), |_| {})
        .expect("subscribed");
    client.resolve(&api.product, &p1).await.expect("p1");
    client.resolve(&api.product, &p3).await.expect("p3");
    client
        .resolve(&api.products, &ProductFilter::all())
        .await
        .expect("catalog");

    let plan = client
        .invalidate_tags(&[Tag::with_id(TagKind::Products, "p1")])
        .await;
    let affected: Vec<String> = plan.affected().map(ToString::to_string).collect();
    assert_eq!(affected.len(), 2);
    assert!(affected.contains(&"product(p1)".to_string()));
    assert!(affected.iter().any(|key| key.starts_with("products(")));
    assert!(!affected.contains(&"product(p3)".to_string()));

    assert_eq!(backend.calls(names::PRODUCT), 3);
}

#[tokio::test(start_paused = true)]
async fn unwatched_entries_are_only_marked_stale() {
    let (client, backend, api) = retaining_marketplace();
    client.resolve(&api.wishlist, &()).await.expect("wishlist");

    let plan = client.invalidate_tags(&[Tag::kind(TagKind::Wishlist)]).await;
    assert!(plan.refetch.is_empty());
    assert_eq!(plan.stale_only.len(), 1);
    assert_eq!(backend.calls(names::WISHLIST), 1);

    let snapshot = client.get_snapshot(&api.wishlist, &()).expect("snapshot");
    assert!(snapshot.stale);

    let _sub = client
        .subscribe(&api.wishlist, &(), |_| {})
        .expect("subscribed");
    client.resolve(&api.wishlist, &()).await.expect("wishlist");
    assert_eq!(backend.calls(names::WISHLIST), 2, "stale entry refetched on subscribe");
}

// ============================================================================
// Re-subscription and release
// ============================================================================

#[tokio::test(start_paused = true)]
async fn one_off_reads_do_not_accumulate() {
    let (client, backend, api) = marketplace();
    for index in 0..1_000 {
        let product_id = format!("p{}", index % 4 + 1);
        let _ = client.resolve(&api.product, &product_id).await;
        let _ = client
            .resolve(&api.product_reviews, &format!("p{index}"))
            .await;
    }
    assert!(client.cached_keys().is_empty());

    let sub = client.subscribe(&api.cart, &(), |_| {}).expect("subscribed");
    client.resolve(&api.cart, &()).await.expect("cart");
    drop(sub);
    assert!(client.cached_keys().is_empty());
    assert_eq!(backend.calls(names::PRODUCT), 1_000, "nothing was served from a leftover entry");
}

#[tokio::test(start_paused = true)]
async fn resubscribing_after_eviction_fetches_exactly_once() {
    let (client, backend, api) = marketplace();

    let sub = client.subscribe(&api.cart, &(), |_| {}).expect("subscribed");
    client.resolve(&api.cart, &()).await.expect("cart");
    assert_eq!(backend.calls(names::CART), 1);
    drop(sub);
    assert!(client.cached_keys().is_empty(), "last subscriber evicts");

    let statuses = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&statuses);
    let first = client
        .subscribe(&api.cart, &(), move |snapshot| {
            sink.lock().expect("sink").push(snapshot.status);
        })
        .expect("subscribed");
    let second = client.subscribe(&api.cart, &(), |_| {}).expect("subscribed");

    let snapshot = client.get_snapshot(&api.cart, &()).expect("snapshot");
    assert_eq!(snapshot.status, QueryStatus::Loading);
    assert!(snapshot.data.is_none(), "no stale read after eviction");
    assert_eq!(snapshot.subscriber_count, 2);

    client.resolve(&api.cart, &()).await.expect("cart");
    assert_eq!(backend.calls(names::CART), 2);
    assert_eq!(
        *statuses.lock().expect("statuses"),
        vec![QueryStatus::Success]
    );

    second.unsubscribe();
    first.unsubscribe();
    assert!(client.cached_keys().is_empty());
}

#[tokio::test(start_paused = true)]
async fn grace_period_keeps_data_for_quick_resubscribe() {
    let client = SyncClient::new(SyncConfig {
        keep_unused_data_for_ms: 1_000,
        ..SyncConfig::default()
    });
    let backend = MarketplaceBackend::seeded(Duration::from_millis(50));
    let api = MarketplaceApi::register(&client, &backend).expect("endpoints register");

    let sub = client.subscribe(&api.cart, &(), |_| {}).expect("subscribed");
    client.resolve(&api.cart, &()).await.expect("cart");
    drop(sub);

    tokio::time::sleep(Duration::from_millis(500)).await;
    let _again = client.subscribe(&api.cart, &(), |_| {}).expect("subscribed");
    client.resolve(&api.cart, &()).await.expect("cart");
    assert_eq!(backend.calls(names::CART), 1, "fresh data reused within grace");

    tokio::time::sleep(Duration::from_millis(2_000)).await;
    assert_eq!(client.cached_keys().len(), 1, "active subscriber keeps entry");
}
