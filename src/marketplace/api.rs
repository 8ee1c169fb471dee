//! Storefront endpoints registered against a [`SyncClient`].
//!
//! Reads provide tags per resource family (and per id where views are keyed by
//! one); writes patch the cached views they affect and invalidate the families
//! whose server-side state they change.

use tracing::info;

use super::backend::MarketplaceBackend;
use super::models::{
    AddToCart, CancelOrder, Cart, DashboardSummary, MarkNotificationRead, NotificationFeed, Order,
    OrderStatus, PlaceOrder, PostReview, Product, ProductFilter, RemoveFromCart, Review, Service,
    ToggleWishlist, UpdateCartQuantity, Wishlist,
};
use crate::sync::{
    MutationEndpoint, MutationHandle, QueryEndpoint, QueryHandle, SyncClient, SyncError, Tag,
    TagKind,
};

/// Endpoint names shared by the cache registrations and the backend call log.
pub mod names {
    pub const PRODUCTS: &str = "products";
    pub const PRODUCT: &str = "product";
    pub const SERVICES: &str = "services";
    pub const PRODUCT_REVIEWS: &str = "product_reviews";
    pub const CART: &str = "cart";
    pub const WISHLIST: &str = "wishlist";
    pub const ORDERS: &str = "orders";
    pub const ORDER: &str = "order";
    pub const NOTIFICATIONS: &str = "notifications";
    pub const DASHBOARD: &str = "dashboard";

    pub const ADD_TO_CART: &str = "add_to_cart";
    pub const UPDATE_CART_QUANTITY: &str = "update_cart_quantity";
    pub const REMOVE_FROM_CART: &str = "remove_from_cart";
    pub const TOGGLE_WISHLIST: &str = "toggle_wishlist";
    pub const PLACE_ORDER: &str = "place_order";
    pub const CANCEL_ORDER: &str = "cancel_order";
    pub const MARK_NOTIFICATION_READ: &str = "mark_notification_read";
    pub const POST_REVIEW: &str = "post_review";
}

/// Typed handles for every storefront endpoint.
#[derive(Clone)]
pub struct MarketplaceApi {
    pub products: QueryHandle<ProductFilter, Vec<Product>>,
    pub product: QueryHandle<String, Product>,
    pub services: QueryHandle<(), Vec<Service>>,
    pub product_reviews: QueryHandle<String, Vec<Review>>,
    pub cart: QueryHandle<(), Cart>,
    pub wishlist: QueryHandle<(), Wishlist>,
    pub orders: QueryHandle<(), Vec<Order>>,
    pub order: QueryHandle<String, Order>,
    pub notifications: QueryHandle<(), NotificationFeed>,
    pub dashboard: QueryHandle<(), DashboardSummary>,

    pub add_to_cart: MutationHandle<AddToCart, Cart>,
    pub update_cart_quantity: MutationHandle<UpdateCartQuantity, Cart>,
    pub remove_from_cart: MutationHandle<RemoveFromCart, Cart>,
    pub toggle_wishlist: MutationHandle<ToggleWishlist, Wishlist>,
    pub place_order: MutationHandle<PlaceOrder, Order>,
    pub cancel_order: MutationHandle<CancelOrder, Order>,
    pub mark_notification_read: MutationHandle<MarkNotificationRead, ()>,
    pub post_review: MutationHandle<PostReview, Review>,
}

fn singleton_key(_: &()) -> String {
    String::new()
}

impl MarketplaceApi {
    /// Register every storefront endpoint on `client`, backed by `backend`.
    pub fn register(client: &SyncClient, backend: &MarketplaceBackend) -> Result<Self, SyncError> {
        let products = {
            let backend = backend.clone();
            client.register_query(
                QueryEndpoint::new(names::PRODUCTS, move |filter: ProductFilter| {
                    let backend = backend.clone();
                    async move { backend.products(filter).await }
                })
                .provides_tags(|products: &Vec<Product>, _| {
                    let mut tags = vec![Tag::kind(TagKind::Products)];
                    tags.extend(
                        products
                            .iter()
                            .map(|product| Tag::with_id(TagKind::Products, product.id.clone())),
                    );
                    tags
                }),
            )?
        };

        let product = {
            let backend = backend.clone();
            client.register_query(
                QueryEndpoint::new(names::PRODUCT, move |id: String| {
                    let backend = backend.clone();
                    async move { backend.product(id).await }
                })
                .key_with(String::clone)
                .provides_tags(|_, id: &String| vec![Tag::with_id(TagKind::Products, id.clone())]),
            )?
        };

        let services = {
            let backend = backend.clone();
            client.register_query(
                QueryEndpoint::new(names::SERVICES, move |_: ()| {
                    let backend = backend.clone();
                    async move { backend.services().await }
                })
                .key_with(singleton_key)
                .provides_tags(|_, _| vec![Tag::kind(TagKind::Services)]),
            )?
        };

        let product_reviews = {
            let backend = backend.clone();
            client.register_query(
                QueryEndpoint::new(names::PRODUCT_REVIEWS, move |product_id: String| {
                    let backend = backend.clone();
                    async move { backend.product_reviews(product_id).await }
                })
                .key_with(String::clone)
                .provides_tags(|_, product_id: &String| {
                    vec![Tag::with_id(TagKind::Reviews, product_id.clone())]
                }),
            )?
        };

        let cart = {
            let backend = backend.clone();
            client.register_query(
                QueryEndpoint::new(names::CART, move |_: ()| {
                    let backend = backend.clone();
                    async move { backend.cart().await }
                })
                .key_with(singleton_key)
                .provides_tags(|_, _| vec![Tag::kind(TagKind::Cart)]),
            )?
        };

        let wishlist = {
            let backend = backend.clone();
            client.register_query(
                QueryEndpoint::new(names::WISHLIST, move |_: ()| {
                    let backend = backend.clone();
                    async move { backend.wishlist().await }
                })
                .key_with(singleton_key)
                .provides_tags(|_, _| vec![Tag::kind(TagKind::Wishlist)]),
            )?
        };

        let orders = {
            let backend = backend.clone();
            client.register_query(
                QueryEndpoint::new(names::ORDERS, move |_: ()| {
                    let backend = backend.clone();
                    async move { backend.orders().await }
                })
                .key_with(singleton_key)
                .provides_tags(|orders: &Vec<Order>, _| {
                    let mut tags = vec![Tag::kind(TagKind::Orders)];
                    tags.extend(
                        orders
                            .iter()
                            .map(|order| Tag::with_id(TagKind::Orders, order.id.clone())),
                    );
                    tags
                }),
            )?
        };

        let order = {
            let backend = backend.clone();
            client.register_query(
                QueryEndpoint::new(names::ORDER, move |id: String| {
                    let backend = backend.clone();
                    async move { backend.order(id).await }
                })
                .key_with(String::clone)
                .provides_tags(|_, id: &String| vec![Tag::with_id(TagKind::Orders, id.clone())]),
            )?
        };

        let notifications = {
            let backend = backend.clone();
            client.register_query(
                QueryEndpoint::new(names::NOTIFICATIONS, move |_: ()| {
                    let backend = backend.clone();
                    async move { backend.notifications().await }
                })
                .key_with(singleton_key)
                .provides_tags(|_, _| vec![Tag::kind(TagKind::Notifications)]),
            )?
        };

        let dashboard = {
            let backend = backend.clone();
            client.register_query(
                QueryEndpoint::new(names::DASHBOARD, move |_: ()| {
                    let backend = backend.clone();
                    async move { backend.dashboard().await }
                })
                .key_with(singleton_key)
                .provides_tags(|_, _| vec![Tag::kind(TagKind::Dashboard)]),
            )?
        };

        let add_to_cart = {
            let backend = backend.clone();
            let cart_view = cart.clone();
            client.register_mutation(
                MutationEndpoint::new(names::ADD_TO_CART, move |args: AddToCart| {
                    let backend = backend.clone();
                    async move { backend.add_to_cart(args).await }
                })
                .optimistic(move |args, draft| {
                    draft.update_query(&cart_view, &(), |cart: &mut Cart| {
                        cart.add_line(&args.product_id, &args.name, args.price);
                    });
                })
                .invalidates_tags(|result, _, _| match result {
                    Some(_) => vec![Tag::kind(TagKind::Cart), Tag::kind(TagKind::Dashboard)],
                    None => Vec::new(),
                })
                .key_with(|args| args.product_id.clone()),
            )?
        };

        let update_cart_quantity = {
            let backend = backend.clone();
            let cart_view = cart.clone();
            client.register_mutation(
                MutationEndpoint::new(
                    names::UPDATE_CART_QUANTITY,
                    move |args: UpdateCartQuantity| {
                        let backend = backend.clone();
                        async move { backend.update_cart_quantity(args).await }
                    },
                )
                .optimistic(move |args, draft| {
                    draft.update_query(&cart_view, &(), |cart: &mut Cart| {
                        cart.set_quantity(&args.product_id, args.quantity);
                    });
                })
                .invalidates_tags(|result, _, _| match result {
                    Some(_) => vec![Tag::kind(TagKind::Cart), Tag::kind(TagKind::Dashboard)],
                    None => Vec::new(),
                })
                .key_with(|args| args.product_id.clone()),
            )?
        };

        let remove_from_cart = {
            let backend = backend.clone();
            let cart_view = cart.clone();
            client.register_mutation(
                MutationEndpoint::new(names::REMOVE_FROM_CART, move |args: RemoveFromCart| {
                    let backend = backend.clone();
                    async move { backend.remove_from_cart(args).await }
                })
                .optimistic(move |args, draft| {
                    draft.update_query(&cart_view, &(), |cart: &mut Cart| {
                        cart.remove_line(&args.product_id);
                    });
                })
                .invalidates_tags(|result, _, _| match result {
                    Some(_) => vec![Tag::kind(TagKind::Cart), Tag::kind(TagKind::Dashboard)],
                    None => Vec::new(),
                }),
            )?
        };

        let toggle_wishlist = {
            let backend = backend.clone();
            let wishlist_view = wishlist.clone();
            client.register_mutation(
                MutationEndpoint::new(names::TOGGLE_WISHLIST, move |args: ToggleWishlist| {
                    let backend = backend.clone();
                    async move { backend.toggle_wishlist(args).await }
                })
                .optimistic(move |args, draft| {
                    draft.update_query(&wishlist_view, &(), |wishlist: &mut Wishlist| {
                        wishlist.toggle(&args.product_id);
                    });
                })
                .invalidates_tags(|result, _, _| match result {
                    Some(_) => vec![
                        Tag::kind(TagKind::Wishlist),
                        Tag::kind(TagKind::Dashboard),
                    ],
                    None => Vec::new(),
                })
                .key_with(|args| args.product_id.clone()),
            )?
        };

        let place_order = {
            let backend = backend.clone();
            client.register_mutation(
                MutationEndpoint::new(names::PLACE_ORDER, move |args: PlaceOrder| {
                    let backend = backend.clone();
                    async move { backend.place_order(args).await }
                })
                .invalidates_tags(|result, error, _| match (result, error) {
                    (Some(_), _) => vec![
                        Tag::kind(TagKind::Cart),
                        Tag::kind(TagKind::Orders),
                        Tag::kind(TagKind::Products),
                        Tag::kind(TagKind::Notifications),
                        Tag::kind(TagKind::Dashboard),
                    ],
                    // Stock moved underneath us; the cached catalog is outdated.
                    (None, Some(error)) if error.is_conflict() => {
                        vec![Tag::kind(TagKind::Products), Tag::kind(TagKind::Cart)]
                    }
                    _ => Vec::new(),
                }),
            )?
        };

        let cancel_order = {
            let backend = backend.clone();
            let orders_view = orders.clone();
            let order_view = order.clone();
            client.register_mutation(
                MutationEndpoint::new(names::CANCEL_ORDER, move |args: CancelOrder| {
                    let backend = backend.clone();
                    async move { backend.cancel_order(args).await }
                })
                .optimistic(move |args, draft| {
                    draft.update_query(&orders_view, &(), |orders: &mut Vec<Order>| {
                        if let Some(order) = orders.iter_mut().find(|order| order.id == args.order_id)
                        {
                            order.status = OrderStatus::Cancelled;
                        }
                    });
                    draft.update_query(&order_view, &args.order_id, |order: &mut Order| {
                        order.status = OrderStatus::Cancelled;
                    });
                })
                .invalidates_tags(|result, error, args| match (result, error) {
                    (Some(_), _) => vec![
                        Tag::kind(TagKind::Orders),
                        Tag::kind(TagKind::Products),
                        Tag::kind(TagKind::Notifications),
                        Tag::kind(TagKind::Dashboard),
                    ],
                    // The order changed or vanished on the server.
                    (None, Some(error)) if error.status_code().is_some() => {
                        vec![Tag::with_id(TagKind::Orders, args.order_id.clone())]
                    }
                    _ => Vec::new(),
                })
                .key_with(|args| args.order_id.clone()),
            )?
        };

        let mark_notification_read = {
            let backend = backend.clone();
            let feed_view = notifications.clone();
            client.register_mutation(
                MutationEndpoint::new(
                    names::MARK_NOTIFICATION_READ,
                    move |args: MarkNotificationRead| {
                        let backend = backend.clone();
                        async move { backend.mark_notification_read(args).await }
                    },
                )
                .optimistic(move |args, draft| {
                    draft.update_query(&feed_view, &(), |feed: &mut NotificationFeed| {
                        feed.mark_read(&args.id);
                    });
                })
                .invalidates_tags(|result, _, _| match result {
                    Some(_) => vec![
                        Tag::kind(TagKind::Notifications),
                        Tag::kind(TagKind::Dashboard),
                    ],
                    None => Vec::new(),
                })
                .key_with(|args| args.id.clone()),
            )?
        };

        let post_review = {
            let backend = backend.clone();
            client.register_mutation(
                MutationEndpoint::new(names::POST_REVIEW, move |args: PostReview| {
                    let backend = backend.clone();
                    async move { backend.post_review(args).await }
                })
                .invalidates_tags(|result, _, args| match result {
                    Some(_) => vec![
                        Tag::with_id(TagKind::Reviews, args.product_id.clone()),
                        Tag::with_id(TagKind::Products, args.product_id.clone()),
                    ],
                    None => Vec::new(),
                }),
            )?
        };

        info!(
            queries = client.endpoints().query_names().len(),
            mutations = client.endpoints().mutation_names().len(),
            "Marketplace endpoints registered"
        );

        Ok(Self {
            products,
            product,
            services,
            product_reviews,
            cart,
            wishlist,
            orders,
            order,
            notifications,
            dashboard,
            add_to_cart,
            update_cart_quantity,
            remove_from_cart,
            toggle_wishlist,
            place_order,
            cancel_order,
            mark_notification_read,
            post_review,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn setup() -> (SyncClient, MarketplaceBackend, MarketplaceApi) {
        let client = SyncClient::default();
        let backend = MarketplaceBackend::seeded(Duration::ZERO);
        let api = MarketplaceApi::register(&client, &backend).expect("endpoints register");
        (client, backend, api)
    }

    #[test]
    fn registers_every_storefront_endpoint() {
        let (client, backend, _) = setup();
        assert_eq!(client.endpoints().query_names().len(), 10);
        assert_eq!(client.endpoints().mutation_names().len(), 8);
        assert_eq!(backend.total_calls(), 0);
        assert!(client.cached_keys().is_empty());
    }

    #[test]
    fn registering_twice_on_one_client_fails() {
        let (client, backend, _) = setup();
        let again = MarketplaceApi::register(&client, &backend);
        assert!(matches!(again, Err(SyncError::DuplicateEndpoint { .. })));
    }

    #[test]
    fn singleton_and_id_keys_are_readable() {
        let (_, _, api) = setup();
        assert_eq!(api.cart.cache_key(&()).expect("key").to_string(), "cart()");
        assert_eq!(
            api.product
                .cache_key(&"p1".to_string())
                .expect("key")
                .to_string(),
            "product(p1)"
        );
    }

    #[tokio::test]
    async fn list_views_provide_family_and_item_tags() {
        let (client, _, api) = setup();
        let _catalog = client
            .subscribe(&api.products, &ProductFilter::category("garden"), |_| {})
            .expect("subscribed");
        client
            .resolve(&api.products, &ProductFilter::category("garden"))
            .await
            .expect("products");

        let snapshot = client
            .get_snapshot(&api.products, &ProductFilter::category("garden"))
            .expect("snapshot");
        assert!(snapshot.tags.contains(&Tag::kind(TagKind::Products)));
        assert!(snapshot.tags.contains(&Tag::with_id(TagKind::Products, "p2")));
        assert!(!snapshot.tags.contains(&Tag::with_id(TagKind::Products, "p1")));
    }

    #[tokio::test]
    async fn review_invalidates_only_that_product() {
        let (client, backend, api) = setup();
        let _lamp = client
            .subscribe(&api.product, &"p1".to_string(), |_| {})
            .expect("subscribed");
        let _notebook = client
            .subscribe(&api.product, &"p3".to_string(), |_| {})
            .expect("subscribed");
        client
            .resolve(&api.product, &"p1".to_string())
            .await
            .expect("lamp");
        client
            .resolve(&api.product, &"p3".to_string())
            .await
            .expect("notebook");
        let before = backend.calls(names::PRODUCT);

        client
            .mutate(
                &api.post_review,
                PostReview {
                    product_id: "p1".to_string(),
                    author: "ana".to_string(),
                    rating: 5,
                    body: "Great".to_string(),
                },
            )
            .await
            .expect("review posted");

        assert_eq!(backend.calls(names::PRODUCT), before + 1);
        let lamp = client
            .get_snapshot(&api.product, &"p1".to_string())
            .expect("snapshot")
            .decode::<Product>()
            .expect("decodes")
            .expect("cached");
        assert_eq!(lamp.review_count, 1);
    }
}
