//! Scripted storefront sessions.
//!
//! Each scenario builds a fresh client and backend, drives the cache the way a
//! storefront page would and checks what a subscriber saw along the way.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::info;

use super::api::{MarketplaceApi, names};
use super::backend::MarketplaceBackend;
use super::models::{
    AddToCart, Cart, DashboardSummary, Order, PlaceOrder, Product, ProductFilter, ToggleWishlist,
    UpdateCartQuantity, Wishlist,
};
use crate::config::ScenarioName;
use crate::infra::error::AppError;
use crate::sync::lock::mutex_lock;
use crate::sync::{EntrySnapshot, MutationStatus, SyncClient, SyncConfig, SyncError, SyncEvent};

const SOURCE: &str = "marketplace::scenario";

/// Client, backend and endpoint handles wired together.
pub struct Storefront {
    pub client: SyncClient,
    pub backend: MarketplaceBackend,
    pub api: MarketplaceApi,
}

impl Storefront {
    pub fn new(config: SyncConfig, latency: Duration) -> Result<Self, SyncError> {
        let client = SyncClient::new(config);
        let backend = MarketplaceBackend::seeded(latency);
        let api = MarketplaceApi::register(&client, &backend)?;
        Ok(Self {
            client,
            backend,
            api,
        })
    }
}

/// Collects every decoded value a subscriber callback receives.
pub struct Observed<T> {
    values: Arc<Mutex<Vec<T>>>,
}

impl<T> Clone for Observed<T> {
    fn clone(&self) -> Self {
        Self {
            values: Arc::clone(&self.values),
        }
    }
}

impl<T> Default for Observed<T> {
    fn default() -> Self {
        Self {
            values: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T: DeserializeOwned + Clone + Send + 'static> Observed<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(&self) -> impl Fn(&EntrySnapshot) + Send + Sync + 'static {
        let values = Arc::clone(&self.values);
        move |snapshot: &EntrySnapshot| {
            if let Ok(Some(value)) = snapshot.decode::<T>() {
                mutex_lock(&values, SOURCE, "observe").push(value);
            }
        }
    }

    pub fn values(&self) -> Vec<T> {
        mutex_lock(&self.values, SOURCE, "values").clone()
    }

    pub fn last(&self) -> Option<T> {
        mutex_lock(&self.values, SOURCE, "last").last().cloned()
    }
}

#[derive(Debug)]
pub struct ScenarioReport {
    pub scenario: ScenarioName,
    pub steps: Vec<String>,
    pub events: Vec<SyncEvent>,
}

impl ScenarioReport {
    fn new(scenario: ScenarioName) -> Self {
        Self {
            scenario,
            steps: Vec::new(),
            events: Vec::new(),
        }
    }

    fn step(&mut self, line: impl Into<String>) {
        let line = line.into();
        info!(scenario = self.scenario.as_str(), step = %line, "Scenario step");
        self.steps.push(line);
    }
}

fn ensure(scenario: ScenarioName, condition: bool, message: impl Into<String>) -> Result<(), AppError> {
    if condition {
        Ok(())
    } else {
        Err(AppError::scenario(scenario.as_str(), message))
    }
}

/// Run one scenario against a fresh storefront.
pub async fn run(
    scenario: ScenarioName,
    config: SyncConfig,
    latency: Duration,
) -> Result<ScenarioReport, AppError> {
    let storefront = Storefront::new(config, latency)?;
    let mut report = match scenario {
        ScenarioName::AddConflict => add_conflict(&storefront).await?,
        ScenarioName::QuantityRace => quantity_race(&storefront).await?,
        ScenarioName::Checkout => checkout(&storefront).await?,
        ScenarioName::OfflineWishlist => offline_wishlist(&storefront).await?,
    };
    report.events = storefront.client.drain_events();
    Ok(report)
}

/// Adding an item another session already put in the cart: the optimistic
/// line shows up at once and is removed again when the server answers 409.
pub async fn add_conflict(storefront: &Storefront) -> Result<ScenarioReport, AppError> {
    let scenario = ScenarioName::AddConflict;
    let Storefront {
        client,
        backend,
        api,
    } = storefront;
    let mut report = ScenarioReport::new(scenario);

    let carts = Observed::<Cart>::new();
    let _cart = client.subscribe(&api.cart, &(), carts.callback())?;
    let cart = client.resolve(&api.cart, &()).await?;
    report.step(format!("cart loaded, total {}", cart.total));

    backend
        .put_cart_line("p1", 1)
        .map_err(|err| AppError::scenario(scenario.as_str(), err.to_string()))?;
    report.step("another session added p1 on the server");

    let outcome = client
        .mutate(
            &api.add_to_cart,
            AddToCart {
                product_id: "p1".to_string(),
                name: "Desk lamp".to_string(),
                price: 500,
            },
        )
        .await;

    let totals: Vec<u64> = carts.values().iter().map(|cart| cart.total).collect();
    ensure(
        scenario,
        totals.contains(&500),
        format!("optimistic total never shown: {totals:?}"),
    )?;
    report.step("optimistic total 500 shown before the server answered");

    let error = match outcome {
        Ok(_) => return Err(AppError::scenario(scenario.as_str(), "server accepted a duplicate add")),
        Err(error) => error,
    };
    ensure(
        scenario,
        error.api_error().is_some_and(|source| source.is_conflict()),
        format!("expected a 409, got {error}"),
    )?;
    report.step(format!("server rejected: {error}"));

    let reverted = client
        .get_snapshot(&api.cart, &())?
        .decode::<Cart>()?
        .unwrap_or_default();
    ensure(
        scenario,
        reverted.total == 0 && !reverted.contains("p1"),
        format!("cart not reverted: total {}", reverted.total),
    )?;
    report.step(format!("cart total reverted to {}", reverted.total));
    Ok(report)
}

/// Two quick quantity edits: the first leaves while offline and fails late,
/// the second succeeds. The cart must end on the server's quantity.
pub async fn quantity_race(storefront: &Storefront) -> Result<ScenarioReport, AppError> {
    let scenario = ScenarioName::QuantityRace;
    let Storefront {
        client,
        backend,
        api,
    } = storefront;
    let mut report = ScenarioReport::new(scenario);

    backend
        .put_cart_line("p1", 1)
        .map_err(|err| AppError::scenario(scenario.as_str(), err.to_string()))?;
    let carts = Observed::<Cart>::new();
    let _cart = client.subscribe(&api.cart, &(), carts.callback())?;
    client.resolve(&api.cart, &()).await?;
    report.step("cart loaded with p1 x1");

    backend.set_offline(true);
    backend.push_latency(names::UPDATE_CART_QUANTITY, Duration::from_millis(500));
    backend.push_latency(names::UPDATE_CART_QUANTITY, Duration::from_millis(200));

    let first = client.mutate(
        &api.update_cart_quantity,
        UpdateCartQuantity {
            product_id: "p1".to_string(),
            quantity: 2,
        },
    );
    let second = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        backend.set_offline(false);
        client
            .mutate(
                &api.update_cart_quantity,
                UpdateCartQuantity {
                    product_id: "p1".to_string(),
                    quantity: 5,
                },
            )
            .await
    };
    let (first, second) = tokio::join!(first, second);

    ensure(
        scenario,
        first.is_err(),
        "the offline update should have failed",
    )?;
    report.step("quantity 2 sent while offline, failed after 500ms");
    let confirmed = second?;
    report.step(format!(
        "quantity 5 confirmed by the server (server quantity {:?})",
        confirmed.quantity_of("p1")
    ));

    let seen: Vec<Option<u32>> = carts
        .values()
        .iter()
        .map(|cart| cart.quantity_of("p1"))
        .collect();
    report.step(format!("subscriber saw quantities {seen:?}"));

    let cached = client
        .get_snapshot(&api.cart, &())?
        .decode::<Cart>()?
        .unwrap_or_default();
    let server = backend.cart_state();
    ensure(
        scenario,
        cached.quantity_of("p1") == Some(5) && server.quantity_of("p1") == Some(5),
        format!(
            "final quantity cached {:?}, server {:?}",
            cached.quantity_of("p1"),
            server.quantity_of("p1")
        ),
    )?;
    report.step("cache and server agree on quantity 5");
    Ok(report)
}

/// Build a cart, place an order, and watch every dependent view refresh.
pub async fn checkout(storefront: &Storefront) -> Result<ScenarioReport, AppError> {
    let scenario = ScenarioName::Checkout;
    let Storefront {
        client,
        backend,
        api,
    } = storefront;
    let mut report = ScenarioReport::new(scenario);

    let carts = Observed::<Cart>::new();
    let orders = Observed::<Vec<Order>>::new();
    let dashboards = Observed::<DashboardSummary>::new();
    let catalogs = Observed::<Vec<Product>>::new();
    let _cart = client.subscribe(&api.cart, &(), carts.callback())?;
    let _orders = client.subscribe(&api.orders, &(), orders.callback())?;
    let _dashboard = client.subscribe(&api.dashboard, &(), dashboards.callback())?;
    let _catalog = client.subscribe(&api.products, &ProductFilter::all(), catalogs.callback())?;

    let catalog = client.resolve(&api.products, &ProductFilter::all()).await?;
    client.resolve(&api.cart, &()).await?;
    client.resolve(&api.orders, &()).await?;
    client.resolve(&api.dashboard, &()).await?;
    report.step(format!("storefront loaded, {} products", catalog.len()));

    client
        .mutate(
            &api.add_to_cart,
            AddToCart {
                product_id: "p2".to_string(),
                name: "Garden hose".to_string(),
                price: 1_200,
            },
        )
        .await?;
    client
        .mutate(
            &api.update_cart_quantity,
            UpdateCartQuantity {
                product_id: "p2".to_string(),
                quantity: 2,
            },
        )
        .await?;
    let status = client.mutation_status(
        &api.update_cart_quantity,
        &UpdateCartQuantity {
            product_id: "p2".to_string(),
            quantity: 2,
        },
    );
    ensure(
        scenario,
        status.is_some_and(|record| record.status == MutationStatus::Fulfilled),
        "quantity update not tracked as fulfilled",
    )?;
    let cart = carts.last().unwrap_or_default();
    report.step(format!("cart holds p2 x2, total {}", cart.total));

    let order = client.mutate(&api.place_order, PlaceOrder::default()).await?;
    report.step(format!("order {} placed, total {}", order.id, order.total));

    let cart = carts.last().unwrap_or_default();
    ensure(scenario, cart.is_empty(), "cart not refreshed after checkout")?;
    let placed = orders.last().unwrap_or_default();
    ensure(
        scenario,
        placed.iter().any(|listed| listed.id == order.id),
        "orders view missing the new order",
    )?;
    let summary = dashboards.last().unwrap_or_default();
    ensure(
        scenario,
        summary.revenue == order.total,
        format!("dashboard revenue {} != {}", summary.revenue, order.total),
    )?;
    let hose_stock = catalogs
        .last()
        .unwrap_or_default()
        .into_iter()
        .find(|product| product.id == "p2")
        .map(|product| product.stock);
    ensure(
        scenario,
        hose_stock == Some(2),
        format!("catalog stock for p2 is {hose_stock:?}"),
    )?;
    report.step(format!(
        "cart emptied, {} order(s) listed, revenue {}, p2 stock {:?}",
        placed.len(),
        summary.revenue,
        hose_stock
    ));
    report.step(format!("backend served {} calls", backend.total_calls()));
    Ok(report)
}

/// Toggle a wishlist entry while offline, then again once reconnected.
pub async fn offline_wishlist(storefront: &Storefront) -> Result<ScenarioReport, AppError> {
    let scenario = ScenarioName::OfflineWishlist;
    let Storefront {
        client,
        backend,
        api,
    } = storefront;
    let mut report = ScenarioReport::new(scenario);

    let wishlists = Observed::<Wishlist>::new();
    let _wishlist = client.subscribe(&api.wishlist, &(), wishlists.callback())?;
    client.resolve(&api.wishlist, &()).await?;

    let toggle = ToggleWishlist {
        product_id: "p3".to_string(),
    };
    backend.set_offline(true);
    let outcome = client.mutate(&api.toggle_wishlist, toggle.clone()).await;
    ensure(
        scenario,
        outcome
            .as_ref()
            .err()
            .and_then(SyncError::api_error)
            .is_some_and(|source| source.is_network()),
        "offline toggle should fail with a network error",
    )?;
    ensure(
        scenario,
        wishlists.values().iter().any(|wishlist| wishlist.contains("p3")),
        "optimistic wishlist entry never shown",
    )?;
    let record = client.mutation_status(&api.toggle_wishlist, &toggle);
    ensure(
        scenario,
        record.is_some_and(|record| record.status == MutationStatus::Rejected),
        "offline toggle not tracked as rejected",
    )?;
    let reverted = wishlists.last().unwrap_or_default();
    ensure(
        scenario,
        !reverted.contains("p3"),
        "wishlist not reverted after network failure",
    )?;
    report.step("offline toggle shown, then reverted after network failure");

    backend.set_offline(false);
    let wishlist = client.mutate(&api.toggle_wishlist, toggle).await?;
    ensure(
        scenario,
        wishlist.contains("p3"),
        "server did not record the toggle",
    )?;
    report.step(format!(
        "online toggle confirmed, {} item(s) wished for",
        wishlist.product_ids.len()
    ));
    Ok(report)
}
