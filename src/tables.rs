//! Table management for dine-in service.
//!
//! Physical tables come from `/tables`; the orders served at a table are
//! grouped server-side into a *table order* (`/table-orders`). A table order
//! is opened when the first guests sit down, accumulates orders, and is
//! closed by paying every outstanding order and completing it as dine-in.
//!
//! The cashier screen keeps a [`TableBoard`] that is only refetched when
//! empty or when another flow raised the `tables_dirty` flag.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::api::{segment, with_query, ApiClient, ApiError};
use crate::db::DbState;
use crate::flags;
use crate::models::{
    canonicalize_keys, de_id, de_opt_string, normalize_aggregate, round_money, wire_token,
    CompletionType, Order, OrderStatus,
};
use crate::orders::{self, CompletionDetails};
use crate::payments::{self, PaymentError, PaymentRequest};

const QR_API_URL: &str = "https://api.qrserver.com/v1/create-qr-code/";
const QR_SIZE: &str = "300x300";

const TABLE_KEYS: &[(&str, &[&str])] = &[
    ("name", &["tableNumber", "table_number", "number", "label"]),
    ("capacity", &["seats", "maxGuests"]),
    (
        "currentTableOrderId",
        &["current_table_order_id", "tableOrderId", "activeTableOrderId"],
    ),
];

const TABLE_ORDER_KEYS: &[(&str, &[&str])] = &[
    ("tableId", &["table_id"]),
    ("guests", &["guestCount", "guest_count", "covers"]),
    ("waiterId", &["waiter_id"]),
    ("openedAt", &["opened_at", "createdAt", "created_at"]),
];

#[derive(Debug, Error)]
pub enum TableError {
    #[error("Table order {0} has unpaid orders and no payment was given")]
    PaymentRequired(String),
    #[error("Cash tendered {tendered:.2} is less than the table balance {due:.2}")]
    InsufficientTender { tendered: f64, due: f64 },
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Table storage: {0}")]
    Storage(String),
    #[error(transparent)]
    Payment(#[from] PaymentError),
    #[error(transparent)]
    Api(#[from] ApiError),
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TableStatus {
    #[default]
    Available,
    Occupied,
    Reserved,
    Other(String),
}

impl From<String> for TableStatus {
    fn from(s: String) -> Self {
        match wire_token(&s).as_str() {
            "AVAILABLE" | "FREE" | "VACANT" => TableStatus::Available,
            "OCCUPIED" | "BUSY" | "IN_USE" => TableStatus::Occupied,
            "RESERVED" => TableStatus::Reserved,
            _ => TableStatus::Other(s),
        }
    }
}

impl From<TableStatus> for String {
    fn from(s: TableStatus) -> Self {
        match s {
            TableStatus::Available => "AVAILABLE".into(),
            TableStatus::Occupied => "OCCUPIED".into(),
            TableStatus::Reserved => "RESERVED".into(),
            TableStatus::Other(raw) => raw,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(default, deserialize_with = "de_name")]
    pub name: String,
    #[serde(default)]
    pub capacity: Option<u32>,
    #[serde(default)]
    pub status: TableStatus,
    #[serde(default, deserialize_with = "de_opt_string", skip_serializing_if = "Option::is_none")]
    pub current_table_order_id: Option<String>,
}

fn de_name<'de, D: serde::Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(de_opt_string(d)?.unwrap_or_default())
}

/// Prepare an entity for serde: flatten, canonicalise, drop null statuses.
fn prepare(value: Value, keys: &[(&str, &[&str])]) -> Value {
    let mut value = normalize_aggregate(value);
    if let Value::Object(map) = &mut value {
        canonicalize_keys(map, keys);
        if map.get("status").map(Value::is_null).unwrap_or(false) {
            map.remove("status");
        }
    }
    value
}

impl Table {
    pub fn from_value(value: Value) -> Result<Table, String> {
        serde_json::from_value(prepare(value, TABLE_KEYS))
            .map_err(|e| format!("Invalid table payload: {e}"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableOrder {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(default, deserialize_with = "de_opt_string")]
    pub table_id: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string")]
    pub status: Option<String>,
    #[serde(default)]
    pub guests: Option<u32>,
    #[serde(default, deserialize_with = "de_opt_string", skip_serializing_if = "Option::is_none")]
    pub waiter_id: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string", skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<String>,
    /// Orders embedded in the response.
    #[serde(skip_deserializing)]
    pub orders: Vec<Order>,
    /// Orders referenced only by id.
    #[serde(skip_deserializing)]
    pub order_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableOrderTotals {
    pub order_count: usize,
    pub total: f64,
    pub amount_paid: f64,
    pub balance_due: f64,
}

impl TableOrder {
    pub fn from_value(value: Value) -> Result<TableOrder, String> {
        let value = match value {
            Value::Object(mut map) if !map.contains_key("id") && !map.contains_key("_id") => {
                map.remove("tableOrder")
                    .or_else(|| map.remove("table_order"))
                    .unwrap_or(Value::Object(map))
            }
            other => other,
        };
        let mut value = prepare(value, TABLE_ORDER_KEYS);
        let raw_orders = match &mut value {
            Value::Object(map) => map.remove("orders"),
            _ => None,
        };
        let mut table_order: TableOrder = serde_json::from_value(value)
            .map_err(|e| format!("Invalid table order payload: {e}"))?;

        if let Some(Value::Array(entries)) = raw_orders {
            for entry in entries {
                match entry {
                    Value::String(id) => table_order.order_ids.push(id),
                    Value::Number(n) => table_order.order_ids.push(n.to_string()),
                    other => table_order.orders.push(Order::from_value(other)?),
                }
            }
        }
        Ok(table_order)
    }

    pub fn is_open(&self) -> bool {
        match self.status.as_deref().map(wire_token) {
            Some(s) => !matches!(s.as_str(), "CLOSED" | "PAID" | "COMPLETED" | "CANCELLED"),
            None => true,
        }
    }

    /// Every order id the table order knows about, embedded ones first.
    pub fn all_order_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.orders.iter().map(|o| o.id.clone()).collect();
        for id in &self.order_ids {
            if !ids.contains(id) {
                ids.push(id.clone());
            }
        }
        ids
    }

    /// Sum of the embedded orders, cancelled ones excluded.
    pub fn totals(&self) -> TableOrderTotals {
        let live: Vec<&Order> = self
            .orders
            .iter()
            .filter(|o| o.status != OrderStatus::Cancelled)
            .collect();
        TableOrderTotals {
            order_count: live.len(),
            total: round_money(live.iter().map(|o| o.effective_total()).sum()),
            amount_paid: round_money(
                live.iter()
                    .map(|o| {
                        if o.is_paid() {
                            o.effective_total()
                        } else {
                            o.amount_paid.unwrap_or(0.0)
                        }
                    })
                    .sum(),
            ),
            balance_due: round_money(live.iter().map(|o| o.balance_due()).sum()),
        }
    }
}

fn parse_table_order(value: Value) -> Result<TableOrder, ApiError> {
    TableOrder::from_value(value).map_err(ApiError::InvalidJson)
}

fn list_entries(value: Value, keys: &[&str]) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        Value::Object(mut map) => keys
            .iter()
            .find_map(|k| match map.remove(*k) {
                Some(Value::Array(items)) => Some(items),
                _ => None,
            })
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

fn table_order_path(id: &str) -> String {
    format!("/table-orders/{}", segment(id))
}

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

pub async fn list_tables(api: &ApiClient) -> Result<Vec<Table>, ApiError> {
    let value = api.get("/tables").await?;
    list_entries(value, &["tables", "items", "results"])
        .into_iter()
        .map(|v| Table::from_value(v).map_err(ApiError::InvalidJson))
        .collect()
}

pub async fn get_table_order(api: &ApiClient, table_order_id: &str) -> Result<TableOrder, ApiError> {
    parse_table_order(api.get(&table_order_path(table_order_id)).await?)
}

/// The open table order seated at `table_id`, if any.
pub async fn get_active_table_order(
    api: &ApiClient,
    table_id: &str,
) -> Result<Option<TableOrder>, ApiError> {
    let path = with_query(
        "/table-orders",
        &[("tableId", table_id.to_string()), ("status", "OPEN".to_string())],
    );
    let value = match api.get(&path).await {
        Ok(v) => v,
        Err(e) if e.is_not_found() => return Ok(None),
        Err(e) => return Err(e),
    };
    let entries = match value {
        Value::Null => return Ok(None),
        Value::Object(map) if map.contains_key("id") || map.contains_key("_id") => {
            vec![Value::Object(map)]
        }
        other => list_entries(other, &["tableOrders", "table_orders", "items", "results"]),
    };
    for entry in entries {
        let table_order = parse_table_order(entry)?;
        let same_table = table_order.table_id.as_deref().map_or(true, |t| t == table_id);
        if same_table && table_order.is_open() {
            return Ok(Some(table_order));
        }
    }
    Ok(None)
}

pub async fn open_table_order(
    api: &ApiClient,
    table_id: &str,
    guests: Option<u32>,
    waiter_id: Option<&str>,
) -> Result<TableOrder, ApiError> {
    let body = json!({ "tableId": table_id, "guests": guests, "waiterId": waiter_id });
    let table_order = parse_table_order(api.post("/table-orders", body).await?)?;
    info!(table_id, table_order_id = %table_order.id, "Table order opened");
    Ok(table_order)
}

/// The open table order at `table_id`, opening one when the table is free.
pub async fn active_or_open(api: &ApiClient, table_id: &str) -> Result<TableOrder, ApiError> {
    match get_active_table_order(api, table_id).await? {
        Some(existing) => Ok(existing),
        None => open_table_order(api, table_id, None, None).await,
    }
}

pub async fn attach_order(
    api: &ApiClient,
    table_order_id: &str,
    order_id: &str,
) -> Result<TableOrder, ApiError> {
    let path = format!("{}/orders", table_order_path(table_order_id));
    let response = api.post(&path, json!({ "orderId": order_id })).await?;
    info!(table_order_id, order_id, "Order attached to table");
    match TableOrder::from_value(response) {
        Ok(table_order) if table_order.id == table_order_id => Ok(table_order),
        _ => get_table_order(api, table_order_id).await,
    }
}

pub async fn transfer_table_order(
    api: &ApiClient,
    table_order_id: &str,
    to_table_id: &str,
) -> Result<TableOrder, ApiError> {
    let path = format!("{}/transfer", table_order_path(table_order_id));
    let response = api.patch(&path, json!({ "toTableId": to_table_id })).await?;
    info!(table_order_id, to_table_id, "Table order transferred");
    match TableOrder::from_value(response) {
        Ok(table_order) if table_order.id == table_order_id => Ok(table_order),
        _ => get_table_order(api, table_order_id).await,
    }
}

// ---------------------------------------------------------------------------
// Closing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableCloseOutcome {
    pub table_order_id: String,
    pub orders: Vec<Order>,
    pub amount_charged: f64,
    pub change_due: f64,
}

/// Settle and close a table order.
///
/// Every order with a balance is paid with `payment`. A cash tender covers
/// the whole table: each order is charged its exact balance and the change
/// is computed once over the total. Orders are then completed as dine-in
/// and the table order is closed. Payments use a key derived from the
/// table order and order ids, so retrying a failed close does not charge
/// twice.
pub async fn close_table_order(
    api: &ApiClient,
    db: &DbState,
    table_order_id: &str,
    payment: Option<&PaymentRequest>,
    shift_id: Option<&str>,
) -> Result<TableCloseOutcome, TableError> {
    let table_order = get_table_order(api, table_order_id).await?;

    let mut live = Vec::new();
    for order_id in table_order.all_order_ids() {
        let order = orders::get_order(api, &order_id).await?;
        if order.status != OrderStatus::Cancelled {
            live.push(order);
        }
    }

    let due = round_money(live.iter().map(Order::balance_due).sum());
    let change_due = match payment {
        _ if due <= 0.0 => 0.0,
        None => return Err(TableError::PaymentRequired(table_order.id.clone())),
        Some(req) if req.method.gives_change() => {
            let tendered = round_money(req.tendered.unwrap_or(due));
            if tendered + 0.005 < due {
                return Err(TableError::InsufficientTender { tendered, due });
            }
            round_money(tendered - due)
        }
        Some(_) => 0.0,
    };

    let mut amount_charged = 0.0;
    if let Some(req) = payment {
        for order in live.iter().filter(|o| o.balance_due() > 0.0) {
            let balance = order.balance_due();
            let per_order = PaymentRequest {
                method: req.method,
                amount: Some(balance),
                tendered: req.method.gives_change().then_some(balance),
                reference: req.reference.clone(),
            };
            let key = format!("table-order:{}:{}", table_order.id, order.id);
            let outcome =
                payments::process_payment(api, order, &per_order, &key, shift_id).await?;
            amount_charged += outcome.amount_charged;
        }
    }

    let details = CompletionDetails {
        completion_type: CompletionType::DineIn,
        table_id: table_order.table_id.clone(),
        delivery_address: None,
    };
    let mut completed = Vec::with_capacity(live.len());
    for order in live {
        if order.status == OrderStatus::Completed {
            completed.push(order);
        } else {
            completed.push(orders::complete_order(api, &order.id, &details).await?);
        }
    }

    let path = format!("{}/close", table_order_path(&table_order.id));
    api.patch(&path, json!({})).await?;

    let amount_charged = round_money(amount_charged);
    for (flag, wanted) in [
        (flags::TABLES_DIRTY, true),
        (flags::ORDERS_DIRTY, true),
        (flags::SHIFT_TOTALS_DIRTY, amount_charged > 0.0),
    ] {
        if wanted {
            if let Err(e) = flags::raise(db, flag, Some(json!({ "tableOrderId": table_order.id }))) {
                warn!(flag, error = %e, "failed to raise refresh flag");
            }
        }
    }

    info!(
        table_order_id = %table_order.id,
        orders = completed.len(),
        charged = %amount_charged,
        change = %change_due,
        "Table order closed"
    );
    Ok(TableCloseOutcome {
        table_order_id: table_order.id,
        orders: completed,
        amount_charged,
        change_due,
    })
}

// ---------------------------------------------------------------------------
// Board
// ---------------------------------------------------------------------------

/// Cached floor plan for the cashier screen.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableBoard {
    pub tables: Vec<Table>,
    pub fetched_at: Option<DateTime<Utc>>,
}

impl TableBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn refresh(&mut self, api: &ApiClient) -> Result<(), TableError> {
        self.tables = list_tables(api).await?;
        self.fetched_at = Some(Utc::now());
        debug!(tables = self.tables.len(), "table board refreshed");
        Ok(())
    }

    /// Refetch when never loaded or when the `tables_dirty` flag was raised.
    /// Returns whether a fetch happened.
    pub async fn refresh_if_needed(
        &mut self,
        api: &ApiClient,
        db: &DbState,
    ) -> Result<bool, TableError> {
        let dirty = flags::take(db, flags::TABLES_DIRTY).map_err(TableError::Storage)?;
        if dirty.is_none() && self.fetched_at.is_some() {
            return Ok(false);
        }
        if let Err(e) = self.refresh(api).await {
            // Keep the signal for the next attempt.
            if let Some(record) = dirty {
                if let Err(flag_err) = flags::raise(db, flags::TABLES_DIRTY, record.payload) {
                    warn!(error = %flag_err, "failed to re-raise tables flag");
                }
            }
            return Err(e);
        }
        Ok(true)
    }

    pub fn table(&self, table_id: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.id == table_id)
    }
}

/// QR code image URL for a table's self-service menu link.
pub fn qr_code_url(table: &Table, menu_base_url: &str) -> Result<String, TableError> {
    let menu = format!("{}/menu", menu_base_url.trim().trim_end_matches('/'));
    let target = reqwest::Url::parse_with_params(&menu, &[("table", table.id.as_str())])
        .map_err(|e| TableError::InvalidUrl(format!("{menu_base_url}: {e}")))?;
    let qr = reqwest::Url::parse_with_params(QR_API_URL, &[("size", QR_SIZE), ("data", target.as_str())])
        .map_err(|e| TableError::InvalidUrl(e.to_string()))?;
    Ok(qr.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::DEFAULT_TIMEOUT;
    use crate::db;
    use crate::models::PaymentMethod;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn table_shapes_are_normalised() {
        let table = Table::from_value(json!({
            "_props": { "tableNumber": "T4", "status": "busy", "seats": 4 },
            "_id": 12
        }))
        .unwrap();
        assert_eq!(table.id, "12");
        assert_eq!(table.name, "T4");
        assert_eq!(table.status, TableStatus::Occupied);
        assert_eq!(table.capacity, Some(4));
    }

    #[test]
    fn table_order_splits_embedded_orders_and_ids() {
        let table_order = TableOrder::from_value(json!({
            "tableOrder": {
                "id": "to1",
                "table_id": "t1",
                "status": "OPEN",
                "orders": [
                    { "id": "o1", "total": 12.5, "paymentStatus": "PAID" },
                    { "id": "o2", "total": 7.5, "amountPaid": 2.5 },
                    { "id": "o3", "total": 99, "status": "CANCELLED" },
                    "o4"
                ]
            }
        }))
        .unwrap();
        assert_eq!(table_order.table_id.as_deref(), Some("t1"));
        assert_eq!(table_order.all_order_ids(), vec!["o1", "o2", "o3", "o4"]);
        let totals = table_order.totals();
        assert_eq!(totals.order_count, 2);
        assert_eq!(totals.total, 20.0);
        assert_eq!(totals.amount_paid, 15.0);
        assert_eq!(totals.balance_due, 5.0);
        assert!(table_order.is_open());
    }

    #[test]
    fn qr_url_encodes_menu_link() {
        let table = Table::from_value(json!({ "id": "t1", "name": "Patio" })).unwrap();
        let url = qr_code_url(&table, "https://shop.example/").unwrap();
        assert_eq!(
            url,
            "https://api.qrserver.com/v1/create-qr-code/?size=300x300&data=https%3A%2F%2Fshop.example%2Fmenu%3Ftable%3Dt1"
        );
        assert!(matches!(qr_code_url(&table, "not a url"), Err(TableError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn active_table_order_missing_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/table-orders"))
            .and(query_param("tableId", "t9"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let api = ApiClient::new(&server.uri(), DEFAULT_TIMEOUT).unwrap();
        assert!(get_active_table_order(&api, "t9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn close_spreads_cash_tender_across_orders() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/table-orders/to1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "to1", "tableId": "t1", "status": "OPEN",
                "orders": [{ "id": "o1", "total": 10 }, "o2"]
            })))
            .mount(&server)
            .await;
        for (id, total) in [("o1", 10.0), ("o2", 5.5)] {
            Mock::given(method("GET"))
                .and(path(format!("/orders/{id}")))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "id": id, "total": total, "status": "CONFIRMED"
                })))
                .mount(&server)
                .await;
            Mock::given(method("POST"))
                .and(path("/payments"))
                .and(body_partial_json(json!({
                    "orderId": id, "amount": total, "tendered": total, "change": 0.0
                })))
                .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                    "id": format!("pay-{id}"), "orderId": id, "amount": total
                })))
                .expect(1)
                .mount(&server)
                .await;
            Mock::given(method("PATCH"))
                .and(path(format!("/orders/{id}/complete")))
                .and(body_partial_json(json!({ "completionType": "DINE_IN", "tableId": "t1" })))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "id": id, "total": total, "status": "COMPLETED", "paymentStatus": "PAID"
                })))
                .mount(&server)
                .await;
        }
        Mock::given(method("PATCH"))
            .and(path("/table-orders/to1/close"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "success": true })))
            .expect(1)
            .mount(&server)
            .await;

        let api = ApiClient::new(&server.uri(), DEFAULT_TIMEOUT).unwrap();
        let db = db::open_in_memory_for_test();
        let cash = PaymentRequest::cash(Some(20.0));
        let outcome = close_table_order(&api, &db, "to1", Some(&cash), Some("s1"))
            .await
            .unwrap();

        assert_eq!(outcome.amount_charged, 15.5);
        assert_eq!(outcome.change_due, 4.5);
        assert!(outcome.orders.iter().all(|o| o.status == OrderStatus::Completed));
        assert!(flags::peek(&db, flags::TABLES_DIRTY).unwrap().is_some());
        assert!(flags::peek(&db, flags::SHIFT_TOTALS_DIRTY).unwrap().is_some());
    }

    #[tokio::test]
    async fn close_without_payment_is_refused_when_balance_due() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/table-orders/to1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "to1", "orders": ["o1"]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/orders/o1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "o1", "total": 3 })))
            .mount(&server)
            .await;

        let api = ApiClient::new(&server.uri(), DEFAULT_TIMEOUT).unwrap();
        let db = db::open_in_memory_for_test();
        let err = close_table_order(&api, &db, "to1", None, None).await.unwrap_err();
        assert!(matches!(err, TableError::PaymentRequired(id) if id == "to1"));

        let short = PaymentRequest {
            method: PaymentMethod::Cash,
            amount: None,
            tendered: Some(1.0),
            reference: None,
        };
        let err = close_table_order(&api, &db, "to1", Some(&short), None).await.unwrap_err();
        assert!(matches!(err, TableError::InsufficientTender { .. }));
    }

    #[tokio::test]
    async fn board_refetches_only_when_flagged() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tables"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "tables": [{ "id": "t1", "name": "One", "status": "AVAILABLE" }]
            })))
            .expect(2)
            .mount(&server)
            .await;

        let api = ApiClient::new(&server.uri(), DEFAULT_TIMEOUT).unwrap();
        let db = db::open_in_memory_for_test();
        let mut board = TableBoard::new();

        assert!(board.refresh_if_needed(&api, &db).await.unwrap());
        assert!(!board.refresh_if_needed(&api, &db).await.unwrap());
        flags::raise(&db, flags::TABLES_DIRTY, None).unwrap();
        assert!(board.refresh_if_needed(&api, &db).await.unwrap());
        assert_eq!(board.table("t1").map(|t| t.name.as_str()), Some("One"));
    }

    #[tokio::test]
    async fn failed_refetch_keeps_tables_flag() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tables"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let api = ApiClient::new(&server.uri(), DEFAULT_TIMEOUT).unwrap();
        let db = db::open_in_memory_for_test();
        flags::raise(&db, flags::TABLES_DIRTY, Some(json!({ "tableId": "t2" }))).unwrap();

        let mut board = TableBoard::new();
        assert!(board.refresh_if_needed(&api, &db).await.is_err());
        let kept = flags::peek(&db, flags::TABLES_DIRTY).unwrap().unwrap();
        assert_eq!(kept.payload, Some(json!({ "tableId": "t2" })));
    }

    #[tokio::test]
    async fn transfer_moves_table_order() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/table-orders/to1/transfer"))
            .and(body_partial_json(json!({ "toTableId": "t5" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "to1", "tableId": "t5", "status": "OPEN"
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/table-orders/to1/transfer"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/table-orders/to1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "to1", "tableId": "t6", "status": "OPEN"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let api = ApiClient::new(&server.uri(), DEFAULT_TIMEOUT).unwrap();
        let moved = transfer_table_order(&api, "to1", "t5").await.unwrap();
        assert_eq!(moved.table_id.as_deref(), Some("t5"));

        // A bare acknowledgement is followed by a re-read.
        let reread = transfer_table_order(&api, "to1", "t6").await.unwrap();
        assert_eq!(reread.table_id.as_deref(), Some("t6"));
    }

    async fn mount_single_order_table(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/table-orders/to1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "to1", "tableId": "t1", "orders": ["o1"]
            })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/orders/o1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "o1", "total": 8, "status": "CONFIRMED", "paymentStatus": "UNPAID"
            })))
            .up_to_n_times(1)
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/payments"))
            .and(header("idempotency-key", "table-order:to1:o1"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({ "message": "duplicate" })))
            .expect(1)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn close_after_earlier_payment_conflict_completes() {
        let server = MockServer::start().await;
        mount_single_order_table(&server).await;
        Mock::given(method("GET"))
            .and(path("/orders/o1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "o1", "total": 8, "status": "CONFIRMED", "paymentStatus": "PAID"
            })))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/orders/o1/complete"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "o1", "total": 8, "status": "COMPLETED", "paymentStatus": "PAID"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/table-orders/to1/close"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let api = ApiClient::new(&server.uri(), DEFAULT_TIMEOUT).unwrap();
        let db = db::open_in_memory_for_test();
        let card = PaymentRequest::card(None);
        let outcome = close_table_order(&api, &db, "to1", Some(&card), None).await.unwrap();
        assert_eq!(outcome.orders[0].status, OrderStatus::Completed);
        assert!(flags::peek(&db, flags::TABLES_DIRTY).unwrap().is_some());
    }

    #[tokio::test]
    async fn close_stops_on_unsettled_payment_conflict() {
        let server = MockServer::start().await;
        mount_single_order_table(&server).await;
        Mock::given(method("GET"))
            .and(path("/orders/o1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "o1", "total": 8, "status": "CONFIRMED", "paymentStatus": "UNPAID"
            })))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/orders/o1/complete"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/table-orders/to1/close"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let api = ApiClient::new(&server.uri(), DEFAULT_TIMEOUT).unwrap();
        let db = db::open_in_memory_for_test();
        let card = PaymentRequest::card(None);
        let err = close_table_order(&api, &db, "to1", Some(&card), None).await.unwrap_err();
        assert!(matches!(
            err,
            TableError::Payment(PaymentError::DuplicatePayment(ref id)) if id == "o1"
        ));
        assert!(flags::peek(&db, flags::TABLES_DIRTY).unwrap().is_none());
    }
}
