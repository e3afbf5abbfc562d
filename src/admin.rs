//! Back-office management endpoints.
//!
//! The admin screens are plain CRUD over a handful of backend collections,
//! so one generic set of operations keyed by [`ResourceKind`] covers them.
//! Records stay as JSON values, normalised through the same `_props`
//! flattening as orders.

use std::fmt;
use std::str::FromStr;

use serde_json::{json, Value};
use tracing::info;

use crate::api::{segment, with_query, ApiClient, ApiError};
use crate::models::normalize_aggregate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Categories,
    Products,
    Customers,
    Taxes,
    Waiters,
    Reservations,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 6] = [
        ResourceKind::Categories,
        ResourceKind::Products,
        ResourceKind::Customers,
        ResourceKind::Taxes,
        ResourceKind::Waiters,
        ResourceKind::Reservations,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Categories => "categories",
            ResourceKind::Products => "products",
            ResourceKind::Customers => "customers",
            ResourceKind::Taxes => "taxes",
            ResourceKind::Waiters => "waiters",
            ResourceKind::Reservations => "reservations",
        }
    }

    fn collection_path(self) -> String {
        format!("/{}", self.as_str())
    }

    fn item_path(self, id: &str) -> String {
        format!("/{}/{}", self.as_str(), segment(id))
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        ResourceKind::ALL
            .into_iter()
            .find(|k| k.as_str() == wanted || k.as_str().trim_end_matches('s') == wanted)
            .or_else(|| match wanted.as_str() {
                "tax" => Some(ResourceKind::Taxes),
                "category" => Some(ResourceKind::Categories),
                _ => None,
            })
            .ok_or_else(|| format!("Unknown resource: {s}"))
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    pub search: Option<String>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

impl ListQuery {
    fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if let Some(search) = self.search.as_deref().filter(|s| !s.trim().is_empty()) {
            params.push(("search", search.trim().to_string()));
        }
        if let Some(page) = self.page {
            params.push(("page", page.to_string()));
        }
        if let Some(limit) = self.limit {
            params.push(("limit", limit.to_string()));
        }
        params
    }
}

fn records(value: Value, kind: ResourceKind) -> Vec<Value> {
    let list = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => [kind.as_str(), "items", "results", "data"]
            .into_iter()
            .find_map(|k| match map.remove(k) {
                Some(Value::Array(items)) => Some(items),
                _ => None,
            })
            .unwrap_or_default(),
        _ => Vec::new(),
    };
    list.into_iter().map(normalize_aggregate).collect()
}

fn require_object(body: &Value) -> Result<(), ApiError> {
    if body.is_object() {
        Ok(())
    } else {
        Err(ApiError::InvalidJson("record body must be a JSON object".into()))
    }
}

// ---------------------------------------------------------------------------
// Generic CRUD
// ---------------------------------------------------------------------------

pub async fn list(api: &ApiClient, kind: ResourceKind, query: &ListQuery) -> Result<Vec<Value>, ApiError> {
    let value = api.get(&with_query(&kind.collection_path(), &query.params())).await?;
    Ok(records(value, kind))
}

pub async fn get(api: &ApiClient, kind: ResourceKind, id: &str) -> Result<Value, ApiError> {
    Ok(normalize_aggregate(api.get(&kind.item_path(id)).await?))
}

pub async fn create(api: &ApiClient, kind: ResourceKind, body: Value) -> Result<Value, ApiError> {
    require_object(&body)?;
    let created = normalize_aggregate(api.post(&kind.collection_path(), body).await?);
    info!(resource = %kind, id = ?created.get("id"), "record created");
    Ok(created)
}

pub async fn update(
    api: &ApiClient,
    kind: ResourceKind,
    id: &str,
    patch: Value,
) -> Result<Value, ApiError> {
    require_object(&patch)?;
    let updated = normalize_aggregate(api.patch(&kind.item_path(id), patch).await?);
    info!(resource = %kind, id, "record updated");
    Ok(updated)
}

pub async fn delete(api: &ApiClient, kind: ResourceKind, id: &str) -> Result<(), ApiError> {
    api.delete(&kind.item_path(id)).await?;
    info!(resource = %kind, id, "record deleted");
    Ok(())
}

// ---------------------------------------------------------------------------
// Business settings
// ---------------------------------------------------------------------------

pub async fn get_business_settings(api: &ApiClient) -> Result<Value, ApiError> {
    Ok(normalize_aggregate(api.get("/business-settings").await?))
}

pub async fn update_business_settings(api: &ApiClient, patch: Value) -> Result<Value, ApiError> {
    require_object(&patch)?;
    let settings = normalize_aggregate(api.patch("/business-settings", patch).await?);
    info!("business settings updated");
    Ok(settings)
}

// ---------------------------------------------------------------------------
// Reservations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Seated,
    Completed,
    Cancelled,
    NoShow,
}

impl ReservationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReservationStatus::Pending => "PENDING",
            ReservationStatus::Confirmed => "CONFIRMED",
            ReservationStatus::Seated => "SEATED",
            ReservationStatus::Completed => "COMPLETED",
            ReservationStatus::Cancelled => "CANCELLED",
            ReservationStatus::NoShow => "NO_SHOW",
        }
    }
}

impl FromStr for ReservationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace(['-', ' '], "_").as_str() {
            "PENDING" => Ok(ReservationStatus::Pending),
            "CONFIRMED" => Ok(ReservationStatus::Confirmed),
            "SEATED" => Ok(ReservationStatus::Seated),
            "COMPLETED" => Ok(ReservationStatus::Completed),
            "CANCELLED" | "CANCELED" => Ok(ReservationStatus::Cancelled),
            "NO_SHOW" | "NOSHOW" => Ok(ReservationStatus::NoShow),
            _ => Err(format!("Invalid reservation status: {s}")),
        }
    }
}

pub async fn set_reservation_status(
    api: &ApiClient,
    reservation_id: &str,
    status: ReservationStatus,
) -> Result<Value, ApiError> {
    let path = format!("{}/status", ResourceKind::Reservations.item_path(reservation_id));
    let result = api.patch(&path, json!({ "status": status.as_str() })).await?;
    info!(reservation_id, status = status.as_str(), "reservation status changed");
    Ok(normalize_aggregate(result))
}

// ---------------------------------------------------------------------------
// Dashboard & taxes
// ---------------------------------------------------------------------------

pub async fn dashboard_summary(api: &ApiClient, branch_id: Option<&str>) -> Result<Value, ApiError> {
    let params: Vec<(&str, String)> = branch_id
        .map(|b| vec![("branchId", b.to_string())])
        .unwrap_or_default();
    api.get(&with_query("/dashboard/summary", &params)).await
}

fn tax_rate_of(tax: &Value) -> Option<f64> {
    let active = ["isActive", "active", "is_active"]
        .iter()
        .find_map(|k| tax.get(*k).and_then(Value::as_bool))
        .unwrap_or(true);
    if !active {
        return None;
    }
    let rate = ["rate", "percentage", "value"].iter().find_map(|k| match tax.get(*k) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().trim_end_matches('%').parse().ok(),
        _ => None,
    })?;
    // Rates above 1 are percentages.
    Some(if rate > 1.0 { rate / 100.0 } else { rate })
}

/// Combined rate of all active taxes, as a fraction, for the cart default.
pub async fn active_tax_rate(api: &ApiClient) -> Result<f64, ApiError> {
    let taxes = list(api, ResourceKind::Taxes, &ListQuery::default()).await?;
    let rate: f64 = taxes.iter().filter_map(tax_rate_of).sum();
    Ok((rate * 10_000.0).round() / 10_000.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::DEFAULT_TIMEOUT;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn resource_names_parse_loosely() {
        assert_eq!("Products".parse::<ResourceKind>().unwrap(), ResourceKind::Products);
        assert_eq!("waiter".parse::<ResourceKind>().unwrap(), ResourceKind::Waiters);
        assert_eq!("tax".parse::<ResourceKind>().unwrap(), ResourceKind::Taxes);
        assert!("suppliers".parse::<ResourceKind>().is_err());
        assert_eq!("no-show".parse::<ReservationStatus>().unwrap(), ReservationStatus::NoShow);
    }

    #[test]
    fn tax_rates_accept_fractions_and_percentages() {
        assert_eq!(tax_rate_of(&json!({ "rate": 0.2 })), Some(0.2));
        assert_eq!(tax_rate_of(&json!({ "percentage": "24%" })), Some(0.24));
        assert_eq!(tax_rate_of(&json!({ "rate": 10, "isActive": false })), None);
        assert_eq!(tax_rate_of(&json!({ "name": "none" })), None);
    }

    #[tokio::test]
    async fn list_passes_query_and_flattens_records() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/products"))
            .and(query_param("search", "latte"))
            .and(query_param("limit", "5"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "products": [{ "_id": "p1", "_props": { "name": "Latte", "price": 4 } }]
            })))
            .mount(&server)
            .await;

        let api = ApiClient::new(&server.uri(), DEFAULT_TIMEOUT).unwrap();
        let query = ListQuery {
            search: Some("latte".into()),
            page: None,
            limit: Some(5),
        };
        let products = list(&api, ResourceKind::Products, &query).await.unwrap();
        assert_eq!(products.len(), 1);
        assert_eq!(products[0]["id"], json!("p1"));
        assert_eq!(products[0]["name"], json!("Latte"));
    }

    #[tokio::test]
    async fn active_tax_rate_sums_active_taxes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/taxes"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "id": 1, "rate": 13, "isActive": true },
                { "id": 2, "rate": 0.05 },
                { "id": 3, "rate": 50, "isActive": false }
            ])))
            .mount(&server)
            .await;

        let api = ApiClient::new(&server.uri(), DEFAULT_TIMEOUT).unwrap();
        assert_eq!(active_tax_rate(&api).await.unwrap(), 0.18);
    }

    #[tokio::test]
    async fn reservation_status_patch() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/reservations/r1/status"))
            .and(body_json(json!({ "status": "SEATED" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "r1", "status": "SEATED" })))
            .expect(1)
            .mount(&server)
            .await;

        let api = ApiClient::new(&server.uri(), DEFAULT_TIMEOUT).unwrap();
        let updated = set_reservation_status(&api, "r1", ReservationStatus::Seated).await.unwrap();
        assert_eq!(updated["status"], json!("SEATED"));
    }

    #[tokio::test]
    async fn create_rejects_non_object_bodies() {
        let api = ApiClient::new("http://localhost:9", DEFAULT_TIMEOUT).unwrap();
        let err = create(&api, ResourceKind::Categories, json!(["x"])).await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidJson(_)));
    }
}
