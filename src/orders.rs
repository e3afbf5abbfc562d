//! Order endpoints of the POS backend.
//!
//! Typed wrappers over `/orders`. Every response goes through
//! [`Order::from_value`] so callers always see the canonical shape.

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::api::{segment, with_query, ApiClient, ApiError};
use crate::models::{CompletionType, Order};

/// Item payload sent when creating an order or adding lines to it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItemInput {
    pub product_id: String,
    pub quantity: u32,
    pub unit_price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Payload for `POST /orders`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderDraft {
    pub items: Vec<OrderItemInput>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_type: Option<CompletionType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discount_amount: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shift_id: Option<String>,
}

/// Filters for `GET /orders`.
#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    pub status: Option<String>,
    pub table_id: Option<String>,
    pub shift_id: Option<String>,
    pub limit: Option<u32>,
}

/// Completion payload for `PATCH /orders/{id}/complete`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionDetails {
    pub completion_type: CompletionType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_address: Option<String>,
}

fn parse_order(value: Value) -> Result<Order, ApiError> {
    Order::from_value(value).map_err(ApiError::InvalidJson)
}

fn order_path(order_id: &str) -> String {
    format!("/orders/{}", segment(order_id))
}

/// Mutations on order lines answer with the order, the touched item, or
/// nothing at all depending on the endpoint version. Only a full order with
/// the expected id is trusted; anything else triggers a re-read.
async fn order_after_mutation(
    api: &ApiClient,
    order_id: &str,
    response: Value,
) -> Result<Order, ApiError> {
    if let Ok(order) = Order::from_value(response) {
        if order.id == order_id {
            return Ok(order);
        }
    }
    debug!(order_id, "mutation response carried no order, re-reading");
    get_order(api, order_id).await
}

pub async fn create_order(api: &ApiClient, draft: &OrderDraft) -> Result<Order, ApiError> {
    let body = serde_json::to_value(draft).map_err(|e| ApiError::InvalidJson(e.to_string()))?;
    let order = parse_order(api.post("/orders", body).await?)?;
    info!(order_id = %order.id, items = order.items.len(), "order created");
    Ok(order)
}

pub async fn get_order(api: &ApiClient, order_id: &str) -> Result<Order, ApiError> {
    parse_order(api.get(&order_path(order_id)).await?)
}

pub async fn list_orders(api: &ApiClient, filter: &OrderFilter) -> Result<Vec<Order>, ApiError> {
    let mut params: Vec<(&str, String)> = Vec::new();
    if let Some(status) = &filter.status {
        params.push(("status", status.clone()));
    }
    if let Some(table_id) = &filter.table_id {
        params.push(("tableId", table_id.clone()));
    }
    if let Some(shift_id) = &filter.shift_id {
        params.push(("shiftId", shift_id.clone()));
    }
    if let Some(limit) = filter.limit {
        params.push(("limit", limit.to_string()));
    }
    let value = api.get(&with_query("/orders", &params)).await?;
    Order::list_from_value(value).map_err(ApiError::InvalidJson)
}

pub async fn add_items(
    api: &ApiClient,
    order_id: &str,
    items: &[OrderItemInput],
) -> Result<Order, ApiError> {
    let path = format!("{}/items", order_path(order_id));
    let response = api.post(&path, json!({ "items": items })).await?;
    order_after_mutation(api, order_id, response).await
}

pub async fn update_item(
    api: &ApiClient,
    order_id: &str,
    item_id: &str,
    quantity: u32,
) -> Result<Order, ApiError> {
    let path = format!("{}/items/{}", order_path(order_id), segment(item_id));
    let response = api.patch(&path, json!({ "quantity": quantity })).await?;
    order_after_mutation(api, order_id, response).await
}

pub async fn remove_item(api: &ApiClient, order_id: &str, item_id: &str) -> Result<Order, ApiError> {
    let path = format!("{}/items/{}", order_path(order_id), segment(item_id));
    let response = api.delete(&path).await?;
    order_after_mutation(api, order_id, response).await
}

/// Patch order-level fields (customer, table, notes, discount).
pub async fn update_order(api: &ApiClient, order_id: &str, patch: Value) -> Result<Order, ApiError> {
    let response = api.patch(&order_path(order_id), patch).await?;
    order_after_mutation(api, order_id, response).await
}

pub async fn confirm_order(api: &ApiClient, order_id: &str) -> Result<Order, ApiError> {
    let path = format!("{}/confirm", order_path(order_id));
    let response = api.patch(&path, json!({})).await?;
    let order = order_after_mutation(api, order_id, response).await?;
    info!(order_id, status = ?order.status, "order confirmed");
    Ok(order)
}

pub async fn cancel_order(
    api: &ApiClient,
    order_id: &str,
    reason: Option<&str>,
) -> Result<Order, ApiError> {
    let path = format!("{}/cancel", order_path(order_id));
    let response = api.patch(&path, json!({ "reason": reason })).await?;
    let order = order_after_mutation(api, order_id, response).await?;
    info!(order_id, "order cancelled");
    Ok(order)
}

pub async fn complete_order(
    api: &ApiClient,
    order_id: &str,
    details: &CompletionDetails,
) -> Result<Order, ApiError> {
    let path = format!("{}/complete", order_path(order_id));
    let body = serde_json::to_value(details).map_err(|e| ApiError::InvalidJson(e.to_string()))?;
    let response = api.patch(&path, body).await?;
    let order = order_after_mutation(api, order_id, response).await?;
    info!(order_id, completion_type = %details.completion_type, "order completed");
    Ok(order)
}
