//! In-memory stand-in for the remote marketplace document store.
//!
//! Every call waits for the configured latency before touching state, so
//! concurrent calls settle in latency order. Offline mode and injected
//! rejections let callers script network failures and server-side conflicts.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use time::OffsetDateTime;
use tracing::{debug, trace};
use uuid::Uuid;

use super::api::names;
use super::models::{
    AddToCart, CancelOrder, Cart, DashboardSummary, MAX_QUANTITY_PER_ITEM, MarkNotificationRead,
    Notification, NotificationFeed, Order, OrderStatus, PlaceOrder, PostReview, Product,
    ProductFilter, RemoveFromCart, Review, Service, ToggleWishlist, UpdateCartQuantity, Wishlist,
};
use crate::sync::ApiError;
use crate::sync::lock::mutex_lock;

const SOURCE: &str = "marketplace::backend";

#[derive(Default)]
struct BackendState {
    products: BTreeMap<String, Product>,
    services: Vec<Service>,
    reviews: Vec<Review>,
    cart: Cart,
    wishlist: Wishlist,
    orders: Vec<Order>,
    notifications: NotificationFeed,
    offline: bool,
    latency: Duration,
    latency_overrides: HashMap<String, VecDeque<Duration>>,
    rejections: HashMap<String, VecDeque<ApiError>>,
    calls: HashMap<String, usize>,
    next_notification: u64,
}

impl BackendState {
    fn notify(&mut self, message: String) {
        self.next_notification += 1;
        self.notifications.items.push(Notification {
            id: format!("n{}", self.next_notification),
            message,
            read: false,
        });
        self.notifications.recount();
    }

    fn product(&self, id: &str) -> Result<&Product, ApiError> {
        self.products
            .get(id)
            .ok_or_else(|| ApiError::not_found(format!("product {id} does not exist")))
    }
}

/// Shared handle to the simulated backend. Clones observe the same state.
#[derive(Clone, Default)]
pub struct MarketplaceBackend {
    state: Arc<Mutex<BackendState>>,
}

impl MarketplaceBackend {
    /// Empty backend with the given round-trip latency.
    pub fn new(latency: Duration) -> Self {
        let backend = Self::default();
        backend.lock("new").latency = latency;
        backend
    }

    /// Backend pre-populated with a small catalog and a welcome notification.
    pub fn seeded(latency: Duration) -> Self {
        let backend = Self::new(latency);
        {
            let mut state = backend.lock("seeded");
            for product in seed_products() {
                state.products.insert(product.id.clone(), product);
            }
            state.services = seed_services();
            state.notify("Welcome to the marketplace".to_string());
        }
        backend
    }

    fn lock(&self, op: &'static str) -> MutexGuard<'_, BackendState> {
        mutex_lock(&self.state, SOURCE, op)
    }

    // ------------------------------------------------------------------------
    // Scripting
    // ------------------------------------------------------------------------

    pub fn set_offline(&self, offline: bool) {
        self.lock("set_offline").offline = offline;
        debug!(offline, "Backend connectivity changed");
    }

    pub fn is_offline(&self) -> bool {
        self.lock("is_offline").offline
    }

    pub fn set_latency(&self, latency: Duration) {
        self.lock("set_latency").latency = latency;
    }

    /// Use `latency` for the next call to `endpoint` instead of the default.
    pub fn push_latency(&self, endpoint: &str, latency: Duration) {
        self.lock("push_latency")
            .latency_overrides
            .entry(endpoint.to_string())
            .or_default()
            .push_back(latency);
    }

    /// Fail the next call to `endpoint` with `error`.
    pub fn reject_next(&self, endpoint: &str, error: ApiError) {
        self.lock("reject_next")
            .rejections
            .entry(endpoint.to_string())
            .or_default()
            .push_back(error);
    }

    /// Number of calls received by `endpoint`, including failed ones.
    pub fn calls(&self, endpoint: &str) -> usize {
        self.lock("calls").calls.get(endpoint).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.lock("total_calls").calls.values().sum()
    }

    /// Add a cart line directly on the server, as another session would.
    pub fn put_cart_line(&self, product_id: &str, quantity: u32) -> Result<(), ApiError> {
        let mut state = self.lock("put_cart_line");
        let product = state.product(product_id)?.clone();
        state.cart.add_line(&product.id, &product.name, product.price);
        state.cart.set_quantity(&product.id, quantity);
        Ok(())
    }

    pub fn set_order_status(&self, order_id: &str, status: OrderStatus) -> Result<(), ApiError> {
        let mut state = self.lock("set_order_status");
        let order = state
            .orders
            .iter_mut()
            .find(|order| order.id == order_id)
            .ok_or_else(|| ApiError::not_found(format!("order {order_id} does not exist")))?;
        order.status = status;
        Ok(())
    }

    /// Server-side cart, bypassing latency and failure injection.
    pub fn cart_state(&self) -> Cart {
        self.lock("cart_state").cart.clone()
    }

    pub fn order_count(&self) -> usize {
        self.lock("order_count").orders.len()
    }

    async fn call<T, F>(&self, endpoint: &'static str, op: F) -> Result<T, ApiError>
    where
        F: FnOnce(&mut BackendState) -> Result<T, ApiError>,
    {
        let (latency, offline, injected) = {
            let mut state = self.lock("call.enter");
            *state.calls.entry(endpoint.to_string()).or_default() += 1;
            let default_latency = state.latency;
            let latency = state
                .latency_overrides
                .get_mut(endpoint)
                .and_then(VecDeque::pop_front)
                .unwrap_or(default_latency);
            let injected = state
                .rejections
                .get_mut(endpoint)
                .and_then(VecDeque::pop_front);
            (latency, state.offline, injected)
        };
        trace!(endpoint, latency_ms = latency.as_millis() as u64, offline, "Backend call");

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if offline {
            return Err(ApiError::network(format!("{endpoint}: backend unreachable")));
        }
        if let Some(error) = injected {
            return Err(error);
        }

        let mut state = self.lock(endpoint);
        op(&mut state)
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    pub async fn products(&self, filter: ProductFilter) -> Result<Vec<Product>, ApiError> {
        self.call(names::PRODUCTS, move |state| {
            Ok(state
                .products
                .values()
                .filter(|product| filter.accepts(product))
                .cloned()
                .collect())
        })
        .await
    }

    pub async fn product(&self, id: String) -> Result<Product, ApiError> {
        self.call(names::PRODUCT, move |state| state.product(&id).cloned())
            .await
    }

    pub async fn services(&self) -> Result<Vec<Service>, ApiError> {
        self.call(names::SERVICES, |state| Ok(state.services.clone()))
            .await
    }

    pub async fn product_reviews(&self, product_id: String) -> Result<Vec<Review>, ApiError> {
        self.call(names::PRODUCT_REVIEWS, move |state| {
            state.product(&product_id)?;
            Ok(state
                .reviews
                .iter()
                .filter(|review| review.product_id == product_id)
                .cloned()
                .collect())
        })
        .await
    }

    pub async fn cart(&self) -> Result<Cart, ApiError> {
        self.call(names::CART, |state| Ok(state.cart.clone())).await
    }

    pub async fn wishlist(&self) -> Result<Wishlist, ApiError> {
        self.call(names::WISHLIST, |state| Ok(state.wishlist.clone()))
            .await
    }

    pub async fn orders(&self) -> Result<Vec<Order>, ApiError> {
        self.call(names::ORDERS, |state| Ok(state.orders.clone()))
            .await
    }

    pub async fn order(&self, id: String) -> Result<Order, ApiError> {
        self.call(names::ORDER, move |state| {
            state
                .orders
                .iter()
                .find(|order| order.id == id)
                .cloned()
                .ok_or_else(|| ApiError::not_found(format!("order {id} does not exist")))
        })
        .await
    }

    pub async fn notifications(&self) -> Result<NotificationFeed, ApiError> {
        self.call(names::NOTIFICATIONS, |state| Ok(state.notifications.clone()))
            .await
    }

    pub async fn dashboard(&self) -> Result<DashboardSummary, ApiError> {
        self.call(names::DASHBOARD, |state| {
            let mut summary = DashboardSummary {
                cart_items: state.cart.item_count(),
                wishlist_items: u32::try_from(state.wishlist.product_ids.len()).unwrap_or(u32::MAX),
                unread_notifications: state.notifications.unread,
                ..DashboardSummary::default()
            };
            for order in &state.orders {
                summary.orders_placed += 1;
                if order.status == OrderStatus::Cancelled {
                    summary.orders_cancelled += 1;
                } else {
                    summary.revenue += order.total;
                }
            }
            Ok(summary)
        })
        .await
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    pub async fn add_to_cart(&self, args: AddToCart) -> Result<Cart, ApiError> {
        self.call(names::ADD_TO_CART, move |state| {
            let product = state.product(&args.product_id)?.clone();
            if state.cart.contains(&product.id) {
                return Err(ApiError::conflict(format!(
                    "{} is already in the cart",
                    product.id
                )));
            }
            if product.stock == 0 {
                return Err(ApiError::status(
                    422,
                    format!("{} is out of stock", product.id),
                ));
            }
            state.cart.add_line(&product.id, &product.name, product.price);
            Ok(state.cart.clone())
        })
        .await
    }

    pub async fn update_cart_quantity(&self, args: UpdateCartQuantity) -> Result<Cart, ApiError> {
        self.call(names::UPDATE_CART_QUANTITY, move |state| {
            if !state.cart.contains(&args.product_id) {
                return Err(ApiError::not_found(format!(
                    "{} is not in the cart",
                    args.product_id
                )));
            }
            if args.quantity > MAX_QUANTITY_PER_ITEM {
                return Err(ApiError::status(
                    422,
                    format!("quantity must not exceed {MAX_QUANTITY_PER_ITEM}"),
                ));
            }
            state.cart.set_quantity(&args.product_id, args.quantity);
            Ok(state.cart.clone())
        })
        .await
    }

    pub async fn remove_from_cart(&self, args: RemoveFromCart) -> Result<Cart, ApiError> {
        self.call(names::REMOVE_FROM_CART, move |state| {
            if !state.cart.remove_line(&args.product_id) {
                return Err(ApiError::not_found(format!(
                    "{} is not in the cart",
                    args.product_id
                )));
            }
            Ok(state.cart.clone())
        })
        .await
    }

    pub async fn toggle_wishlist(&self, args: ToggleWishlist) -> Result<Wishlist, ApiError> {
        self.call(names::TOGGLE_WISHLIST, move |state| {
            state.product(&args.product_id)?;
            state.wishlist.toggle(&args.product_id);
            Ok(state.wishlist.clone())
        })
        .await
    }

    pub async fn place_order(&self, args: PlaceOrder) -> Result<Order, ApiError> {
        self.call(names::PLACE_ORDER, move |state| {
            if state.cart.is_empty() {
                return Err(ApiError::status(422, "cart is empty"));
            }
            for item in state.cart.items.values() {
                let product = state.product(&item.product_id)?;
                if product.stock < item.quantity {
                    return Err(ApiError::conflict(format!(
                        "insufficient stock for {}",
                        item.product_id
                    )));
                }
            }

            let cart = std::mem::take(&mut state.cart);
            for item in cart.items.values() {
                if let Some(product) = state.products.get_mut(&item.product_id) {
                    product.stock -= item.quantity;
                }
            }

            let order = Order {
                id: new_order_id(),
                items: cart.items.into_values().collect(),
                total: cart.total,
                status: OrderStatus::Placed,
                placed_at: OffsetDateTime::now_utc().unix_timestamp(),
            };
            let message = match args.note {
                Some(note) => format!("Order {} placed ({note})", order.id),
                None => format!("Order {} placed", order.id),
            };
            state.orders.push(order.clone());
            state.notify(message);
            Ok(order)
        })
        .await
    }

    pub async fn cancel_order(&self, args: CancelOrder) -> Result<Order, ApiError> {
        self.call(names::CANCEL_ORDER, move |state| {
            let position = state
                .orders
                .iter()
                .position(|order| order.id == args.order_id)
                .ok_or_else(|| {
                    ApiError::not_found(format!("order {} does not exist", args.order_id))
                })?;

            let status = state.orders[position].status;
            if status != OrderStatus::Placed {
                return Err(ApiError::conflict(format!(
                    "order {} is already {}",
                    args.order_id,
                    status.as_str()
                )));
            }

            state.orders[position].status = OrderStatus::Cancelled;
            let order = state.orders[position].clone();
            for item in &order.items {
                if let Some(product) = state.products.get_mut(&item.product_id) {
                    product.stock += item.quantity;
                }
            }
            state.notify(format!("Order {} cancelled", order.id));
            Ok(order)
        })
        .await
    }

    pub async fn mark_notification_read(&self, args: MarkNotificationRead) -> Result<(), ApiError> {
        self.call(names::MARK_NOTIFICATION_READ, move |state| {
            if state.notifications.mark_read(&args.id) {
                Ok(())
            } else {
                Err(ApiError::not_found(format!(
                    "notification {} does not exist",
                    args.id
                )))
            }
        })
        .await
    }

    pub async fn post_review(&self, args: PostReview) -> Result<Review, ApiError> {
        self.call(names::POST_REVIEW, move |state| {
            if !(1..=5).contains(&args.rating) {
                return Err(ApiError::status(422, "rating must be between 1 and 5"));
            }
            state.product(&args.product_id)?;

            let review = Review {
                id: format!("r{}", state.reviews.len() + 1),
                product_id: args.product_id,
                author: args.author,
                rating: args.rating,
                body: args.body,
            };
            if let Some(product) = state.products.get_mut(&review.product_id) {
                product.review_count += 1;
            }
            state.reviews.push(review.clone());
            Ok(review)
        })
        .await
    }
}

fn new_order_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("o-{}", &id[..8])
}

fn seed_products() -> Vec<Product> {
    [
        ("p1", "Desk lamp", "home", 500, 10),
        ("p2", "Garden hose", "garden", 1_200, 4),
        ("p3", "Notebook", "office", 300, 25),
        ("p4", "Plant pot", "garden", 800, 0),
    ]
    .into_iter()
    .map(|(id, name, category, price, stock)| Product {
        id: id.to_string(),
        name: name.to_string(),
        category: category.to_string(),
        price,
        stock,
        review_count: 0,
    })
    .collect()
}

fn seed_services() -> Vec<Service> {
    vec![
        Service {
            id: "s1".to_string(),
            name: "Furniture assembly".to_string(),
            provider: "Handy Co".to_string(),
            hourly_rate: 4_000,
        },
        Service {
            id: "s2".to_string(),
            name: "Garden design".to_string(),
            provider: "Green Thumb".to_string(),
            hourly_rate: 6_500,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(product_id: &str) -> AddToCart {
        AddToCart {
            product_id: product_id.to_string(),
            name: String::new(),
            price: 0,
        }
    }

    #[tokio::test]
    async fn duplicate_cart_add_is_a_conflict() {
        let backend = MarketplaceBackend::seeded(Duration::ZERO);
        backend.add_to_cart(add("p1")).await.expect("first add");

        let error = backend.add_to_cart(add("p1")).await.expect_err("duplicate");
        assert!(error.is_conflict());
        assert_eq!(backend.calls(names::ADD_TO_CART), 2);
    }

    #[tokio::test]
    async fn server_prices_win_over_client_arguments() {
        let backend = MarketplaceBackend::seeded(Duration::ZERO);
        let cart = backend
            .add_to_cart(AddToCart {
                product_id: "p1".to_string(),
                name: "Lamp".to_string(),
                price: 1,
            })
            .await
            .expect("added");
        assert_eq!(cart.total, 500);
    }

    #[tokio::test]
    async fn offline_calls_fail_with_network_errors() {
        let backend = MarketplaceBackend::seeded(Duration::ZERO);
        backend.set_offline(true);
        let error = backend.cart().await.expect_err("offline");
        assert!(error.is_network());

        backend.set_offline(false);
        assert!(backend.cart().await.is_ok());
    }

    #[tokio::test]
    async fn injected_rejection_applies_once() {
        let backend = MarketplaceBackend::seeded(Duration::ZERO);
        backend.reject_next(names::WISHLIST, ApiError::status(503, "maintenance"));

        let error = backend.wishlist().await.expect_err("rejected");
        assert_eq!(error.status_code(), Some(503));
        assert!(backend.wishlist().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn latency_overrides_are_per_endpoint() {
        let backend = MarketplaceBackend::seeded(Duration::from_millis(50));
        backend.push_latency(names::CART, Duration::from_millis(500));

        let started = tokio::time::Instant::now();
        backend.cart().await.expect("cart");
        assert!(started.elapsed() >= Duration::from_millis(500));

        let started = tokio::time::Instant::now();
        backend.cart().await.expect("cart");
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn placing_an_order_empties_cart_and_updates_stock() {
        let backend = MarketplaceBackend::seeded(Duration::ZERO);
        backend.put_cart_line("p2", 2).expect("line added");

        let order = backend
            .place_order(PlaceOrder::default())
            .await
            .expect("order placed");
        assert_eq!(order.total, 2_400);
        assert!(backend.cart_state().is_empty());

        let hose = backend.product("p2".to_string()).await.expect("product");
        assert_eq!(hose.stock, 2);

        let feed = backend.notifications().await.expect("feed");
        assert_eq!(feed.unread, 2);
    }

    #[tokio::test]
    async fn empty_cart_cannot_be_ordered() {
        let backend = MarketplaceBackend::seeded(Duration::ZERO);
        let error = backend
            .place_order(PlaceOrder::default())
            .await
            .expect_err("empty cart");
        assert_eq!(error.status_code(), Some(422));
    }

    #[tokio::test]
    async fn shipped_orders_cannot_be_cancelled() {
        let backend = MarketplaceBackend::seeded(Duration::ZERO);
        backend.put_cart_line("p3", 1).expect("line added");
        let order = backend
            .place_order(PlaceOrder::default())
            .await
            .expect("order placed");
        backend
            .set_order_status(&order.id, OrderStatus::Shipped)
            .expect("shipped");

        let error = backend
            .cancel_order(CancelOrder {
                order_id: order.id.clone(),
            })
            .await
            .expect_err("shipped");
        assert!(error.is_conflict());
    }

    #[tokio::test]
    async fn dashboard_counts_revenue_of_active_orders() {
        let backend = MarketplaceBackend::seeded(Duration::ZERO);
        backend.put_cart_line("p1", 2).expect("line added");
        let order = backend
            .place_order(PlaceOrder::default())
            .await
            .expect("order placed");
        backend.put_cart_line("p3", 1).expect("line added");
        backend
            .place_order(PlaceOrder::default())
            .await
            .expect("order placed");
        backend
            .cancel_order(CancelOrder { order_id: order.id })
            .await
            .expect("cancelled");

        let summary = backend.dashboard().await.expect("dashboard");
        assert_eq!(summary.orders_placed, 2);
        assert_eq!(summary.orders_cancelled, 1);
        assert_eq!(summary.revenue, 300);
    }

    #[tokio::test]
    async fn reviews_bump_product_review_count() {
        let backend = MarketplaceBackend::seeded(Duration::ZERO);
        backend
            .post_review(PostReview {
                product_id: "p1".to_string(),
                author: "ana".to_string(),
                rating: 4,
                body: "Bright".to_string(),
            })
            .await
            .expect("review posted");

        let reviews = backend
            .product_reviews("p1".to_string())
            .await
            .expect("reviews");
        assert_eq!(reviews.len(), 1);
        let lamp = backend.product("p1".to_string()).await.expect("product");
        assert_eq!(lamp.review_count, 1);
    }
}
