//! Cart management.
//!
//! The cart is the local mirror of a server-side order. Line edits are
//! applied optimistically, sent to the backend, and then replaced by whatever
//! the server answers; a failed request restores the cart as it was. Totals
//! come from the server snapshot when it covers the current lines and fall
//! back to local arithmetic otherwise.

use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::api::{ApiClient, ApiError};
use crate::db::DbState;
use crate::models::{round_money, Order, OrderItem};
use crate::orders::{self, OrderDraft, OrderItemInput};

/// Snapshot slot for the register's active cart.
pub const ACTIVE_SLOT: &str = "active";

#[derive(Debug, Error)]
pub enum CartError {
    #[error("Quantity must be greater than zero")]
    InvalidQuantity,
    #[error("Unit price must not be negative")]
    InvalidPrice,
    #[error("Product {0} is not in the cart")]
    NotInCart(String),
    #[error("Line for product {0} has not been saved to the order yet")]
    Unsynced(String),
    #[error("Cart storage: {0}")]
    Storage(String),
    #[error(transparent)]
    Api(#[from] ApiError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartLine {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    pub product_id: String,
    pub name: String,
    pub quantity: u32,
    pub unit_price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl CartLine {
    pub fn new(product_id: &str, name: &str, quantity: u32, unit_price: f64) -> Self {
        Self {
            item_id: None,
            product_id: product_id.to_string(),
            name: name.to_string(),
            quantity,
            unit_price,
            notes: None,
        }
    }

    pub fn with_notes(mut self, notes: Option<String>) -> Self {
        self.notes = notes.filter(|n| !n.trim().is_empty());
        self
    }

    pub fn line_total(&self) -> f64 {
        round_money(self.quantity as f64 * self.unit_price)
    }

    fn validate(&self) -> Result<(), CartError> {
        if self.quantity == 0 {
            return Err(CartError::InvalidQuantity);
        }
        if self.unit_price.is_nan() || self.unit_price < 0.0 {
            return Err(CartError::InvalidPrice);
        }
        Ok(())
    }

    /// Lines are identified by product and notes; "oat milk" and plain are
    /// separate lines of the same product.
    fn is_keyed(&self, product_id: &str, notes: Option<&str>) -> bool {
        self.product_id == product_id && note_key(&self.notes) == notes
    }
}

fn note_key(notes: &Option<String>) -> Option<&str> {
    notes.as_deref().filter(|n| !n.trim().is_empty())
}

fn lookup_key(notes: Option<&str>) -> Option<&str> {
    notes.filter(|n| !n.trim().is_empty())
}

impl From<&OrderItem> for CartLine {
    fn from(item: &OrderItem) -> Self {
        Self {
            item_id: item.id.clone(),
            product_id: item.product_id.clone().unwrap_or_default(),
            name: item.name.clone(),
            quantity: item.quantity,
            unit_price: item.unit_price,
            notes: item.notes.clone().filter(|n| !n.trim().is_empty()),
        }
    }
}

impl From<&CartLine> for OrderItemInput {
    fn from(line: &CartLine) -> Self {
        Self {
            product_id: line.product_id.clone(),
            quantity: line.quantity,
            unit_price: line.unit_price,
            notes: line.notes.clone(),
        }
    }
}

/// Where the figures in [`CartTotals`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TotalsSource {
    Server,
    Local,
    Mixed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CartTotals {
    pub subtotal: f64,
    pub discount: f64,
    pub tax: f64,
    pub total: f64,
    pub amount_paid: f64,
    pub balance_due: f64,
    pub source: TotalsSource,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cart {
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub lines: Vec<CartLine>,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub table_id: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub discount: f64,
    #[serde(default)]
    pub tax_rate: f64,
    /// Last order body the server returned.
    #[serde(default)]
    pub server: Option<Order>,
    /// Idempotency key of the payment currently being attempted.
    #[serde(default)]
    pub payment_attempt_key: Option<String>,
}

impl Cart {
    pub fn new(tax_rate: f64) -> Self {
        Self {
            tax_rate: tax_rate.max(0.0),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn item_count(&self) -> u32 {
        self.lines.iter().map(|l| l.quantity).sum()
    }

    /// Add a line, merging with an existing line for the same product and notes.
    pub fn add_line(&mut self, line: CartLine) -> Result<(), CartError> {
        line.validate()?;
        let notes = note_key(&line.notes);
        if let Some(existing) = self
            .lines
            .iter_mut()
            .find(|l| l.is_keyed(&line.product_id, notes))
        {
            existing.quantity = existing.quantity.saturating_add(line.quantity);
            existing.unit_price = line.unit_price;
        } else {
            self.lines.push(line);
        }
        Ok(())
    }

    fn position(&self, product_id: &str, notes: Option<&str>) -> Result<usize, CartError> {
        let notes = lookup_key(notes);
        self.lines
            .iter()
            .position(|l| l.is_keyed(product_id, notes))
            .ok_or_else(|| CartError::NotInCart(product_id.to_string()))
    }

    /// Set the quantity of the line for `product_id` with `notes`; zero
    /// removes it.
    pub fn set_quantity(
        &mut self,
        product_id: &str,
        notes: Option<&str>,
        quantity: u32,
    ) -> Result<(), CartError> {
        if quantity == 0 {
            return self.remove_line(product_id, notes).map(|_| ());
        }
        let idx = self.position(product_id, notes)?;
        self.lines[idx].quantity = quantity;
        Ok(())
    }

    pub fn remove_line(&mut self, product_id: &str, notes: Option<&str>) -> Result<CartLine, CartError> {
        let idx = self.position(product_id, notes)?;
        Ok(self.lines.remove(idx))
    }

    pub fn line(&self, product_id: &str, notes: Option<&str>) -> Option<&CartLine> {
        let notes = lookup_key(notes);
        self.lines.iter().find(|l| l.is_keyed(product_id, notes))
    }

    /// Reset to an empty cart, keeping the tax rate.
    pub fn clear(&mut self) {
        *self = Cart::new(self.tax_rate);
    }

    /// Mirror whatever the server returned.
    pub fn reconcile(&mut self, order: Order) {
        self.order_id = Some(order.id.clone());
        self.lines = order.items.iter().map(CartLine::from).collect();
        if order.customer_id.is_some() {
            self.customer_id = order.customer_id.clone();
        }
        if order.table_id.is_some() {
            self.table_id = order.table_id.clone();
        }
        if order.notes.is_some() {
            self.notes = order.notes.clone();
        }
        if let Some(discount) = order.discount_amount {
            self.discount = discount;
        }
        debug!(order_id = %order.id, lines = self.lines.len(), "cart reconciled with server order");
        self.server = Some(order);
    }

    /// Draft used to create the server order from local lines.
    pub fn to_draft(&self) -> OrderDraft {
        OrderDraft {
            items: self.lines.iter().map(OrderItemInput::from).collect(),
            customer_id: self.customer_id.clone(),
            table_id: self.table_id.clone(),
            notes: self.notes.clone(),
            completion_type: None,
            discount_amount: (self.discount > 0.0).then_some(self.discount),
            shift_id: None,
        }
    }

    /// Whether the server snapshot describes the same lines as the cart.
    fn server_covers_lines(&self, order: &Order) -> bool {
        let mut local: Vec<(&str, Option<&str>, u32)> = self
            .lines
            .iter()
            .map(|l| (l.product_id.as_str(), note_key(&l.notes), l.quantity))
            .collect();
        let mut remote: Vec<(&str, Option<&str>, u32)> = order
            .items
            .iter()
            .map(|i| (i.product_id.as_deref().unwrap_or(""), note_key(&i.notes), i.quantity))
            .collect();
        local.sort_unstable();
        remote.sort_unstable();
        local == remote
    }

    pub fn totals(&self) -> CartTotals {
        let server = self
            .server
            .as_ref()
            .filter(|order| self.server_covers_lines(order));
        let mut from_server = 0;
        let mut from_local = 0;
        let mut pick = |server_value: Option<f64>, local: &dyn Fn() -> f64| match server_value {
            Some(v) => {
                from_server += 1;
                round_money(v)
            }
            None => {
                from_local += 1;
                round_money(local())
            }
        };

        let local_subtotal: f64 = self.lines.iter().map(CartLine::line_total).sum();
        let subtotal = pick(server.and_then(|o| o.subtotal), &|| local_subtotal);
        let discount = pick(server.and_then(|o| o.discount_amount), &|| self.discount)
            .clamp(0.0, subtotal.max(0.0));
        let tax = pick(server.and_then(|o| o.tax_amount), &|| {
            (subtotal - discount) * self.tax_rate
        });
        let total = pick(server.and_then(|o| o.total), &|| subtotal - discount + tax);

        let amount_paid = round_money(server.and_then(|o| o.amount_paid).unwrap_or(0.0));
        let balance_due = if server.map(Order::is_paid).unwrap_or(false) {
            0.0
        } else {
            round_money((total - amount_paid).max(0.0))
        };

        let source = match (from_server, from_local) {
            (_, 0) => TotalsSource::Server,
            (0, _) => TotalsSource::Local,
            _ => TotalsSource::Mixed,
        };

        CartTotals {
            subtotal,
            discount,
            tax,
            total,
            amount_paid,
            balance_due,
            source,
        }
    }
}

// ---------------------------------------------------------------------------
// Remote operations
// ---------------------------------------------------------------------------

/// Apply the outcome of a remote call: reconcile on success, restore the
/// pre-edit cart on failure.
fn settle(cart: &mut Cart, before: Cart, result: Result<Order, ApiError>) -> Result<(), CartError> {
    match result {
        Ok(order) => {
            cart.reconcile(order);
            Ok(())
        }
        Err(e) => {
            warn!(error = %e, "cart update rejected by server, rolling back");
            *cart = before;
            Err(e.into())
        }
    }
}

/// Add a line. The first line of a cart without a server order creates it.
pub async fn add_item(api: &ApiClient, cart: &mut Cart, line: CartLine) -> Result<(), CartError> {
    let before = cart.clone();
    cart.add_line(line.clone())?;

    let result = match cart.order_id.clone() {
        None => orders::create_order(api, &cart.to_draft()).await,
        Some(order_id) => orders::add_items(api, &order_id, &[OrderItemInput::from(&line)]).await,
    };
    settle(cart, before, result)?;
    info!(product_id = %line.product_id, quantity = line.quantity, "item added to cart");
    Ok(())
}

pub async fn update_quantity(
    api: &ApiClient,
    cart: &mut Cart,
    product_id: &str,
    notes: Option<&str>,
    quantity: u32,
) -> Result<(), CartError> {
    if quantity == 0 {
        return remove_item(api, cart, product_id, notes).await;
    }
    let before = cart.clone();
    cart.set_quantity(product_id, notes, quantity)?;

    let Some(order_id) = cart.order_id.clone() else {
        return Ok(());
    };
    let item_id = match before.line(product_id, notes).and_then(|l| l.item_id.clone()) {
        Some(id) => id,
        None => {
            *cart = before;
            return Err(CartError::Unsynced(product_id.to_string()));
        }
    };
    let result = orders::update_item(api, &order_id, &item_id, quantity).await;
    settle(cart, before, result)
}

pub async fn remove_item(
    api: &ApiClient,
    cart: &mut Cart,
    product_id: &str,
    notes: Option<&str>,
) -> Result<(), CartError> {
    let before = cart.clone();
    let removed = cart.remove_line(product_id, notes)?;

    let Some(order_id) = cart.order_id.clone() else {
        return Ok(());
    };
    let Some(item_id) = removed.item_id else {
        *cart = before;
        return Err(CartError::Unsynced(product_id.to_string()));
    };
    let result = orders::remove_item(api, &order_id, &item_id).await;
    settle(cart, before, result)
}

/// Attach a customer to the cart and, when it exists, the server order.
pub async fn assign_customer(
    api: &ApiClient,
    cart: &mut Cart,
    customer_id: &str,
) -> Result<(), CartError> {
    let before = cart.clone();
    cart.customer_id = Some(customer_id.to_string());
    let Some(order_id) = cart.order_id.clone() else {
        return Ok(());
    };
    let result = orders::update_order(api, &order_id, json!({ "customerId": customer_id })).await;
    settle(cart, before, result)
}

/// Re-read the server order into the cart.
pub async fn refresh(api: &ApiClient, cart: &mut Cart) -> Result<(), CartError> {
    let Some(order_id) = cart.order_id.clone() else {
        return Ok(());
    };
    let order = orders::get_order(api, &order_id).await?;
    cart.reconcile(order);
    Ok(())
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

pub fn save_snapshot(db: &DbState, slot: &str, cart: &Cart) -> Result<(), CartError> {
    let payload = serde_json::to_string(cart).map_err(|e| CartError::Storage(e.to_string()))?;
    let conn = db.conn.lock().map_err(|e| CartError::Storage(e.to_string()))?;
    conn.execute(
        "INSERT INTO cart_snapshots (slot, payload, updated_at) VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(slot) DO UPDATE SET payload = excluded.payload, updated_at = excluded.updated_at",
        params![slot, payload],
    )
    .map_err(|e| CartError::Storage(format!("save cart: {e}")))?;
    Ok(())
}

pub fn load_snapshot(db: &DbState, slot: &str) -> Result<Option<Cart>, CartError> {
    let conn = db.conn.lock().map_err(|e| CartError::Storage(e.to_string()))?;
    let payload: Option<String> = conn
        .query_row(
            "SELECT payload FROM cart_snapshots WHERE slot = ?1",
            params![slot],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| CartError::Storage(format!("load cart: {e}")))?;
    match payload {
        Some(p) => match serde_json::from_str::<Cart>(&p) {
            Ok(cart) => Ok(Some(cart)),
            Err(e) => {
                warn!(slot, error = %e, "discarding unreadable cart snapshot");
                Ok(None)
            }
        },
        None => Ok(None),
    }
}

pub fn clear_snapshot(db: &DbState, slot: &str) -> Result<(), CartError> {
    let conn = db.conn.lock().map_err(|e| CartError::Storage(e.to_string()))?;
    conn.execute("DELETE FROM cart_snapshots WHERE slot = ?1", params![slot])
        .map_err(|e| CartError::Storage(format!("clear cart: {e}")))?;
    Ok(())
}
