//! Typed mirror of the server-side aggregates (orders, items, payments).
//!
//! The backend is not consistent about its JSON shape: entities may arrive
//! wrapped in `_props`, with camelCase or snake_case keys, with numeric or
//! string ids and with money serialised as strings. Everything here is
//! normalised into one canonical shape before deserialising.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Nested collections that are themselves aggregates.
const NESTED_AGGREGATES: &[&str] = &["items", "orderItems", "order_items", "orders", "payments"];

const ORDER_KEYS: &[(&str, &[&str])] = &[
    ("orderNumber", &["order_number", "number"]),
    ("paymentStatus", &["payment_status"]),
    ("completionType", &["completion_type", "orderType", "order_type"]),
    ("items", &["orderItems", "order_items"]),
    ("subtotal", &["subTotal", "sub_total"]),
    ("taxAmount", &["tax_amount", "tax", "totalTax"]),
    ("discountAmount", &["discount_amount", "discount"]),
    ("total", &["totalAmount", "total_amount", "grandTotal"]),
    ("amountPaid", &["amount_paid", "paidAmount", "paid_amount"]),
    ("tableId", &["table_id"]),
    ("tableOrderId", &["table_order_id"]),
    ("customerId", &["customer_id"]),
    ("shiftId", &["shift_id"]),
    ("notes", &["note", "specialInstructions"]),
    ("createdAt", &["created_at"]),
];

const ITEM_KEYS: &[(&str, &[&str])] = &[
    ("productId", &["product_id"]),
    ("name", &["productName", "product_name"]),
    ("quantity", &["qty"]),
    ("unitPrice", &["unit_price", "price"]),
    ("totalPrice", &["total_price", "lineTotal", "line_total", "subtotal"]),
    ("notes", &["note"]),
];

// ---------------------------------------------------------------------------
// Shape normalisation
// ---------------------------------------------------------------------------

/// Flatten `_props` wrappers and lift `_id` into `id`, recursively for nested
/// aggregates. Direct non-null fields win over `_props` fields.
pub fn normalize_aggregate(value: Value) -> Value {
    match value {
        Value::Object(mut map) => {
            let props_key = ["_props", "props"]
                .into_iter()
                .find(|k| matches!(map.get(*k), Some(Value::Object(_))));
            if let Some(key) = props_key {
                if let Some(Value::Object(props)) = map.remove(key) {
                    for (k, v) in props {
                        let has_direct = map.get(&k).map(|d| !d.is_null()).unwrap_or(false);
                        if !has_direct {
                            map.insert(k, v);
                        }
                    }
                }
            }
            if map.get("id").map(Value::is_null).unwrap_or(true) {
                if let Some(id) = map.remove("_id") {
                    map.insert("id".to_string(), id);
                }
            }
            for key in NESTED_AGGREGATES {
                if let Some(child) = map.remove(*key) {
                    map.insert((*key).to_string(), normalize_aggregate(child));
                }
            }
            Value::Object(map)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_aggregate).collect()),
        other => other,
    }
}

/// Move alias keys onto their canonical name. The canonical key wins when
/// it already holds a non-null value; otherwise the first non-null alias is
/// used. All alias keys are removed.
pub(crate) fn canonicalize_keys(map: &mut Map<String, Value>, table: &[(&str, &[&str])]) {
    for (canonical, aliases) in table {
        let mut chosen = map.remove(*canonical).filter(|v| !v.is_null());
        for alias in *aliases {
            if let Some(v) = map.remove(*alias) {
                if chosen.is_none() && !v.is_null() {
                    chosen = Some(v);
                }
            }
        }
        if let Some(v) = chosen {
            map.insert((*canonical).to_string(), v);
        }
    }
}

fn canonicalize_item(value: Value) -> Value {
    let Value::Object(mut map) = value else {
        return value;
    };
    // Items sometimes embed the product instead of copying its fields.
    if let Some(Value::Object(product)) = map.get("product").cloned() {
        for (from, to) in [("id", "productId"), ("name", "name"), ("price", "unitPrice")] {
            if map.get(to).map(Value::is_null).unwrap_or(true) {
                if let Some(v) = product.get(from) {
                    map.insert(to.to_string(), v.clone());
                }
            }
        }
        map.remove("product");
    }
    canonicalize_keys(&mut map, ITEM_KEYS);
    Value::Object(map)
}

fn canonicalize_order(value: Value) -> Value {
    let Value::Object(mut map) = value else {
        return value;
    };
    canonicalize_keys(&mut map, ORDER_KEYS);
    if let Some(Value::Array(items)) = map.remove("items") {
        map.insert(
            "items".to_string(),
            Value::Array(items.into_iter().map(canonicalize_item).collect()),
        );
    }
    Value::Object(map)
}

// ---------------------------------------------------------------------------
// Lenient field deserialisers
// ---------------------------------------------------------------------------

pub(crate) fn de_id<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match Value::deserialize(d)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("invalid id: {other}"))),
    }
}

pub(crate) fn de_opt_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::String(s) if !s.trim().is_empty() => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn money_from_value(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|f| f.is_finite())
}

pub(crate) fn de_opt_money<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
    Ok(money_from_value(&Value::deserialize(d)?))
}

pub(crate) fn de_money<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    Ok(money_from_value(&Value::deserialize(d)?).unwrap_or(0.0))
}

fn de_quantity<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
    let v = Value::deserialize(d)?;
    let qty = match &v {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f.round() as u64)),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    qty.map(|q| q.min(u32::MAX as u64) as u32)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid quantity: {v}")))
}

fn one() -> u32 {
    1
}

/// Round to cents, half away from zero.
pub fn round_money(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

pub(crate) fn wire_token(s: &str) -> String {
    s.trim().to_ascii_uppercase().replace(['-', ' '], "_")
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OrderStatus {
    #[default]
    Pending,
    Confirmed,
    InProgress,
    Ready,
    Completed,
    Cancelled,
    Other(String),
}

impl OrderStatus {
    /// The order has passed confirmation (the kitchen/bar has it).
    pub fn is_confirmed_or_later(&self) -> bool {
        matches!(
            self,
            OrderStatus::Confirmed
                | OrderStatus::InProgress
                | OrderStatus::Ready
                | OrderStatus::Completed
        )
    }

    pub fn is_final(&self) -> bool {
        matches!(self, OrderStatus::Completed | OrderStatus::Cancelled)
    }
}

impl From<String> for OrderStatus {
    fn from(s: String) -> Self {
        match wire_token(&s).as_str() {
            "PENDING" | "DRAFT" | "OPEN" | "NEW" => OrderStatus::Pending,
            "CONFIRMED" => OrderStatus::Confirmed,
            "IN_PROGRESS" | "PREPARING" => OrderStatus::InProgress,
            "READY" => OrderStatus::Ready,
            "COMPLETED" | "DELIVERED" | "CLOSED" => OrderStatus::Completed,
            "CANCELLED" | "CANCELED" => OrderStatus::Cancelled,
            _ => OrderStatus::Other(s),
        }
    }
}

impl From<OrderStatus> for String {
    fn from(s: OrderStatus) -> Self {
        match s {
            OrderStatus::Pending => "PENDING".into(),
            OrderStatus::Confirmed => "CONFIRMED".into(),
            OrderStatus::InProgress => "IN_PROGRESS".into(),
            OrderStatus::Ready => "READY".into(),
            OrderStatus::Completed => "COMPLETED".into(),
            OrderStatus::Cancelled => "CANCELLED".into(),
            OrderStatus::Other(raw) => raw,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PaymentStatus {
    #[default]
    Unpaid,
    PartiallyPaid,
    Paid,
    Refunded,
    Other(String),
}

impl From<String> for PaymentStatus {
    fn from(s: String) -> Self {
        match wire_token(&s).as_str() {
            "UNPAID" | "PENDING" | "NOT_PAID" => PaymentStatus::Unpaid,
            "PARTIALLY_PAID" | "PARTIAL" => PaymentStatus::PartiallyPaid,
            "PAID" | "COMPLETED" | "SETTLED" => PaymentStatus::Paid,
            "REFUNDED" => PaymentStatus::Refunded,
            _ => PaymentStatus::Other(s),
        }
    }
}

impl From<PaymentStatus> for String {
    fn from(s: PaymentStatus) -> Self {
        match s {
            PaymentStatus::Unpaid => "UNPAID".into(),
            PaymentStatus::PartiallyPaid => "PARTIALLY_PAID".into(),
            PaymentStatus::Paid => "PAID".into(),
            PaymentStatus::Refunded => "REFUNDED".into(),
            PaymentStatus::Other(raw) => raw,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    #[serde(alias = "cash")]
    Cash,
    #[serde(alias = "card", alias = "CREDIT_CARD", alias = "DEBIT_CARD")]
    Card,
    #[serde(alias = "transfer", alias = "BANK_TRANSFER")]
    Transfer,
}

impl PaymentMethod {
    pub fn gives_change(self) -> bool {
        matches!(self, PaymentMethod::Cash)
    }
}

impl FromStr for PaymentMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match wire_token(s).as_str() {
            "CASH" => Ok(PaymentMethod::Cash),
            "CARD" | "CREDIT_CARD" | "DEBIT_CARD" => Ok(PaymentMethod::Card),
            "TRANSFER" | "BANK_TRANSFER" => Ok(PaymentMethod::Transfer),
            _ => Err(format!("Invalid payment method: {s}. Must be cash, card or transfer")),
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PaymentMethod::Cash => "CASH",
            PaymentMethod::Card => "CARD",
            PaymentMethod::Transfer => "TRANSFER",
        })
    }
}

/// How the order is fulfilled once paid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompletionType {
    #[serde(alias = "pickup", alias = "TAKEAWAY")]
    Pickup,
    #[serde(alias = "delivery")]
    Delivery,
    #[serde(alias = "dine_in", alias = "DINEIN")]
    DineIn,
}

impl FromStr for CompletionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match wire_token(s).as_str() {
            "PICKUP" | "TAKEAWAY" => Ok(CompletionType::Pickup),
            "DELIVERY" => Ok(CompletionType::Delivery),
            "DINE_IN" | "DINEIN" => Ok(CompletionType::DineIn),
            _ => Err(format!(
                "Invalid completion type: {s}. Must be pickup, delivery or dine-in"
            )),
        }
    }
}

impl fmt::Display for CompletionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CompletionType::Pickup => "PICKUP",
            CompletionType::Delivery => "DELIVERY",
            CompletionType::DineIn => "DINE_IN",
        })
    }
}

// ---------------------------------------------------------------------------
// Aggregates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    #[serde(default, deserialize_with = "de_opt_string", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string")]
    pub product_id: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default = "one", deserialize_with = "de_quantity")]
    pub quantity: u32,
    #[serde(default, deserialize_with = "de_money")]
    pub unit_price: f64,
    #[serde(default, deserialize_with = "de_opt_money", skip_serializing_if = "Option::is_none")]
    pub total_price: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_string", skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl OrderItem {
    /// Server line total when given, else quantity × unit price.
    pub fn line_total(&self) -> f64 {
        round_money(
            self.total_price
                .unwrap_or(self.quantity as f64 * self.unit_price),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(default, deserialize_with = "de_opt_string", skip_serializing_if = "Option::is_none")]
    pub order_number: Option<String>,
    #[serde(default)]
    pub status: OrderStatus,
    #[serde(default)]
    pub payment_status: PaymentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_type: Option<CompletionType>,
    #[serde(default)]
    pub items: Vec<OrderItem>,
    #[serde(default, deserialize_with = "de_opt_money", skip_serializing_if = "Option::is_none")]
    pub subtotal: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_money", skip_serializing_if = "Option::is_none")]
    pub tax_amount: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_money", skip_serializing_if = "Option::is_none")]
    pub discount_amount: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_money", skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_money", skip_serializing_if = "Option::is_none")]
    pub amount_paid: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_string", skip_serializing_if = "Option::is_none")]
    pub table_id: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string", skip_serializing_if = "Option::is_none")]
    pub table_order_id: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string", skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string", skip_serializing_if = "Option::is_none")]
    pub shift_id: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string", skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl Order {
    /// Parse a server order in any of the shapes the backend produces.
    pub fn from_value(value: Value) -> Result<Order, String> {
        let value = match value {
            // Some endpoints answer `{ "order": {...} }`.
            Value::Object(mut map) if !map.contains_key("id") && map.contains_key("order") => {
                map.remove("order").unwrap_or(Value::Null)
            }
            other => other,
        };
        let normalized = canonicalize_order(normalize_aggregate(value));
        serde_json::from_value(normalized).map_err(|e| format!("Invalid order payload: {e}"))
    }

    /// Parse a list response (`[...]`, `{ "orders": [...] }` or `{ "items": [...] }`).
    pub fn list_from_value(value: Value) -> Result<Vec<Order>, String> {
        let list = match value {
            Value::Array(items) => items,
            Value::Object(mut map) => match map
                .remove("orders")
                .or_else(|| map.remove("items"))
                .or_else(|| map.remove("results"))
            {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            },
            _ => Vec::new(),
        };
        list.into_iter().map(Order::from_value).collect()
    }

    pub fn is_paid(&self) -> bool {
        self.payment_status == PaymentStatus::Paid
    }

    /// Sum of line totals.
    pub fn items_subtotal(&self) -> f64 {
        round_money(self.items.iter().map(OrderItem::line_total).sum())
    }

    /// Server total when present, else items − discount + tax.
    pub fn effective_total(&self) -> f64 {
        self.total.map(round_money).unwrap_or_else(|| {
            let subtotal = self.subtotal.unwrap_or_else(|| self.items_subtotal());
            let discount = self.discount_amount.unwrap_or(0.0).min(subtotal);
            round_money(subtotal - discount + self.tax_amount.unwrap_or(0.0))
        })
    }

    /// Outstanding amount; zero once the server reports the order paid.
    pub fn balance_due(&self) -> f64 {
        if self.is_paid() {
            return 0.0;
        }
        round_money((self.effective_total() - self.amount_paid.unwrap_or(0.0)).max(0.0))
    }
}

/// A payment as returned by `/payments`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    #[serde(default, deserialize_with = "de_opt_string", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, alias = "order_id", deserialize_with = "de_opt_string")]
    pub order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<PaymentMethod>,
    #[serde(default, deserialize_with = "de_money")]
    pub amount: f64,
    #[serde(default, deserialize_with = "de_opt_string", skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, alias = "created_at", deserialize_with = "de_opt_string", skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl Payment {
    pub fn from_value(value: Value) -> Result<Payment, String> {
        let value = match value {
            Value::Object(mut map) if !map.contains_key("amount") && map.contains_key("payment") => {
                map.remove("payment").unwrap_or(Value::Null)
            }
            other => other,
        };
        serde_json::from_value(normalize_aggregate(value))
            .map_err(|e| format!("Invalid payment payload: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn props_wrapper_is_flattened_with_direct_fields_winning() {
        let raw = json!({
            "_id": "ord-1",
            "status": "CONFIRMED",
            "_props": {
                "status": "PENDING",
                "totalAmount": "18.50",
                "items": [{ "_props": { "productId": 7, "quantity": 2, "unitPrice": 9.25 } }]
            }
        });
        let order = Order::from_value(raw).unwrap();
        assert_eq!(order.id, "ord-1");
        assert_eq!(order.status, OrderStatus::Confirmed);
        assert_eq!(order.total, Some(18.5));
        assert_eq!(order.items.len(), 1);
        assert_eq!(order.items[0].product_id.as_deref(), Some("7"));
        assert_eq!(order.items[0].line_total(), 18.5);
    }

    #[test]
    fn null_direct_field_is_filled_from_props() {
        let raw = json!({ "id": 3, "tableId": null, "_props": { "tableId": "t-4" } });
        let order = Order::from_value(raw).unwrap();
        assert_eq!(order.id, "3");
        assert_eq!(order.table_id.as_deref(), Some("t-4"));
    }

    #[test]
    fn snake_case_and_embedded_product_are_canonicalized() {
        let raw = json!({
            "order": {
                "id": "o9",
                "payment_status": "paid",
                "order_type": "dine_in",
                "order_items": [
                    { "product": { "id": "p1", "name": "Latte", "price": "4.20" }, "qty": 3 }
                ],
                "tax_amount": 1.26
            }
        });
        let order = Order::from_value(raw).unwrap();
        assert!(order.is_paid());
        assert_eq!(order.completion_type, Some(CompletionType::DineIn));
        assert_eq!(order.items[0].name, "Latte");
        assert_eq!(order.items[0].quantity, 3);
        assert_eq!(order.items_subtotal(), 12.6);
        assert_eq!(order.effective_total(), 13.86);
        assert_eq!(order.balance_due(), 0.0);
    }

    #[test]
    fn canonical_key_wins_over_alias() {
        let raw = json!({ "id": "o1", "total": 10, "totalAmount": 99 });
        let order = Order::from_value(raw).unwrap();
        assert_eq!(order.total, Some(10.0));
    }

    #[test]
    fn balance_accounts_for_partial_payment() {
        let raw = json!({ "id": "o1", "total": 30, "amountPaid": 12.5, "paymentStatus": "PARTIAL" });
        let order = Order::from_value(raw).unwrap();
        assert_eq!(order.payment_status, PaymentStatus::PartiallyPaid);
        assert_eq!(order.balance_due(), 17.5);
    }

    #[test]
    fn unknown_status_is_preserved() {
        let order = Order::from_value(json!({ "id": "o1", "status": "ON_HOLD" })).unwrap();
        assert_eq!(order.status, OrderStatus::Other("ON_HOLD".into()));
        let back = serde_json::to_value(&order).unwrap();
        assert_eq!(back["status"], "ON_HOLD");
    }

    #[test]
    fn list_accepts_wrapped_and_bare_arrays() {
        let bare = Order::list_from_value(json!([{ "id": 1 }, { "id": 2 }])).unwrap();
        assert_eq!(bare.len(), 2);
        let wrapped = Order::list_from_value(json!({ "orders": [{ "id": "a" }] })).unwrap();
        assert_eq!(wrapped[0].id, "a");
    }

    #[test]
    fn parse_enums_from_cli_spelling() {
        assert_eq!("dine-in".parse::<CompletionType>().unwrap(), CompletionType::DineIn);
        assert_eq!("Cash".parse::<PaymentMethod>().unwrap(), PaymentMethod::Cash);
        assert!("cheque".parse::<PaymentMethod>().is_err());
        assert_eq!(CompletionType::DineIn.to_string(), "DINE_IN");
    }

    #[test]
    fn round_money_half_away_from_zero() {
        assert_eq!(round_money(2.675_000_1), 2.68);
        assert_eq!(round_money(-1.235_000_1), -1.24);
        assert_eq!(round_money(10.0), 10.0);
    }
}
