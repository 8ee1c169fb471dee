//! Storefront payloads exchanged with the backend and held in the cache.
//!
//! Prices are integer minor units. Collections keyed by id use ordered maps so
//! optimistic patches touch stable paths (`items.<product_id>.quantity`).

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Upper bound for a single cart line.
pub const MAX_QUANTITY_PER_ITEM: u32 = 99;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub category: String,
    pub price: u64,
    pub stock: u32,
    #[serde(default)]
    pub review_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProductFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl ProductFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn category(category: impl Into<String>) -> Self {
        Self {
            category: Some(category.into()),
        }
    }

    pub fn accepts(&self, product: &Product) -> bool {
        self.category
            .as_deref()
            .is_none_or(|category| product.category == category)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub hourly_rate: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub id: String,
    pub product_id: String,
    pub author: String,
    pub rating: u8,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartItem {
    pub product_id: String,
    pub name: String,
    pub unit_price: u64,
    pub quantity: u32,
}

impl CartItem {
    pub fn line_total(&self) -> u64 {
        self.unit_price.saturating_mul(u64::from(self.quantity))
    }
}

/// Shopping cart; `total` is kept in sync with `items` by every mutator.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Cart {
    pub items: BTreeMap<String, CartItem>,
    pub total: u64,
}

impl Cart {
    pub fn contains(&self, product_id: &str) -> bool {
        self.items.contains_key(product_id)
    }

    pub fn quantity_of(&self, product_id: &str) -> Option<u32> {
        self.items.get(product_id).map(|item| item.quantity)
    }

    /// Add one unit of a product. Returns false if the line already exists.
    pub fn add_line(&mut self, product_id: &str, name: &str, unit_price: u64) -> bool {
        if self.items.contains_key(product_id) {
            return false;
        }
        self.items.insert(
            product_id.to_string(),
            CartItem {
                product_id: product_id.to_string(),
                name: name.to_string(),
                unit_price,
                quantity: 1,
            },
        );
        self.recalculate();
        true
    }

    /// Set a line's quantity; zero removes the line.
    pub fn set_quantity(&mut self, product_id: &str, quantity: u32) -> bool {
        if quantity == 0 {
            return self.remove_line(product_id);
        }
        let Some(item) = self.items.get_mut(product_id) else {
            return false;
        };
        item.quantity = quantity.min(MAX_QUANTITY_PER_ITEM);
        self.recalculate();
        true
    }

    pub fn remove_line(&mut self, product_id: &str) -> bool {
        let removed = self.items.remove(product_id).is_some();
        if removed {
            self.recalculate();
        }
        removed
    }

    pub fn item_count(&self) -> u32 {
        self.items.values().map(|item| item.quantity).sum()
    }

    pub fn recalculate(&mut self) {
        self.total = self.items.values().map(CartItem::line_total).sum();
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Wishlist {
    pub product_ids: BTreeSet<String>,
}

impl Wishlist {
    /// Flip membership; returns whether the product is now wished for.
    pub fn toggle(&mut self, product_id: &str) -> bool {
        if self.product_ids.remove(product_id) {
            false
        } else {
            self.product_ids.insert(product_id.to_string());
            true
        }
    }

    pub fn contains(&self, product_id: &str) -> bool {
        self.product_ids.contains(product_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Placed,
    Shipped,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Placed => "placed",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub items: Vec<CartItem>,
    pub total: u64,
    pub status: OrderStatus,
    /// Unix timestamp (seconds).
    pub placed_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub message: String,
    pub read: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NotificationFeed {
    pub items: Vec<Notification>,
    pub unread: u32,
}

impl NotificationFeed {
    pub fn mark_read(&mut self, id: &str) -> bool {
        let Some(item) = self.items.iter_mut().find(|item| item.id == id) else {
            return false;
        };
        item.read = true;
        self.recount();
        true
    }

    pub fn recount(&mut self) {
        let unread = self.items.iter().filter(|item| !item.read).count();
        self.unread = u32::try_from(unread).unwrap_or(u32::MAX);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DashboardSummary {
    pub orders_placed: u32,
    pub orders_cancelled: u32,
    pub revenue: u64,
    pub cart_items: u32,
    pub wishlist_items: u32,
    pub unread_notifications: u32,
}

// ============================================================================
// Mutation arguments
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddToCart {
    pub product_id: String,
    pub name: String,
    pub price: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateCartQuantity {
    pub product_id: String,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveFromCart {
    pub product_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToggleWishlist {
    pub product_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlaceOrder {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelOrder {
    pub order_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkNotificationRead {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostReview {
    pub product_id: String,
    pub author: String,
    pub rating: u8,
    pub body: String,
}
