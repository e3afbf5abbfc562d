//! Shift management for Counter POS.
//!
//! A shift is the cashier's work session, tracked by the backend. The client
//! starts and ends it, remembers the open shift id locally so payments can be
//! attributed to it, and derives the cash summary shown when closing:
//! expected = opening + cash sales - cash refunds - cash paid out,
//! variance = counted - expected.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::api::{segment, ApiClient, ApiError};
use crate::db::{self, DbState};
use crate::flags;
use crate::models::{
    canonicalize_keys, de_money, de_opt_money, de_opt_string, normalize_aggregate, round_money,
};

const SHIFT_SETTINGS_CATEGORY: &str = "shift";
const CURRENT_SHIFT_KEY: &str = "current_shift_id";

const SHIFT_KEYS: &[(&str, &[&str])] = &[
    ("cashierId", &["cashier_id", "userId", "user_id"]),
    ("startedAt", &["started_at", "startTime", "start_time"]),
    ("endedAt", &["ended_at", "endTime", "end_time"]),
    ("openingCash", &["opening_cash", "startingCash", "startingAmount"]),
    ("closingCash", &["closing_cash", "endingCash", "endingAmount"]),
    ("cashSales", &["cash_sales", "totalCash", "total_cash"]),
    ("cardSales", &["card_sales", "totalCard", "total_card"]),
    ("totalSales", &["total_sales"]),
    ("cashRefunds", &["cash_refunds"]),
    ("cashOut", &["cash_out", "paidOut"]),
    ("orderCount", &["order_count", "ordersCount", "totalOrders"]),
    ("expectedCash", &["expected_cash"]),
    ("variance", &["cashVariance", "cash_variance"]),
];

#[derive(Debug, Error)]
pub enum ShiftError {
    #[error("A shift is already open ({0})")]
    AlreadyOpen(String),
    #[error("No open shift")]
    NoOpenShift,
    #[error("Cash amount must not be negative")]
    InvalidAmount,
    #[error("Shift storage: {0}")]
    Storage(String),
    #[error(transparent)]
    Api(#[from] ApiError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shift {
    #[serde(deserialize_with = "crate::models::de_id")]
    pub id: String,
    #[serde(default, deserialize_with = "de_opt_string")]
    pub cashier_id: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string")]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string")]
    pub started_at: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string")]
    pub ended_at: Option<String>,
    #[serde(default, deserialize_with = "de_money")]
    pub opening_cash: f64,
    #[serde(default, deserialize_with = "de_opt_money")]
    pub closing_cash: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_money")]
    pub cash_sales: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_money")]
    pub card_sales: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_money")]
    pub total_sales: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_money")]
    pub cash_refunds: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_money")]
    pub cash_out: Option<f64>,
    #[serde(default)]
    pub order_count: Option<u64>,
    #[serde(default, deserialize_with = "de_opt_money")]
    pub expected_cash: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_money")]
    pub variance: Option<f64>,
}

impl Shift {
    pub fn from_value(value: Value) -> Result<Shift, String> {
        let value = match value {
            Value::Object(mut map) if !map.contains_key("id") && map.contains_key("shift") => {
                map.remove("shift").unwrap_or(Value::Null)
            }
            other => other,
        };
        let mut value = normalize_aggregate(value);
        if let Value::Object(map) = &mut value {
            canonicalize_keys(map, SHIFT_KEYS);
        }
        serde_json::from_value(value).map_err(|e| format!("Invalid shift payload: {e}"))
    }

    pub fn is_open(&self) -> bool {
        match self.status.as_deref().map(|s| s.to_ascii_uppercase()) {
            Some(s) => matches!(s.as_str(), "OPEN" | "ACTIVE" | "IN_PROGRESS" | "STARTED"),
            None => self.ended_at.is_none(),
        }
    }

    pub fn summary(&self) -> ShiftSummary {
        let cash_sales = round_money(self.cash_sales.unwrap_or(0.0));
        let card_sales = round_money(self.card_sales.unwrap_or(0.0));
        let expected_cash = round_money(self.expected_cash.unwrap_or_else(|| {
            self.opening_cash + cash_sales
                - self.cash_refunds.unwrap_or(0.0)
                - self.cash_out.unwrap_or(0.0)
        }));
        let variance = self
            .variance
            .or_else(|| self.closing_cash.map(|closing| closing - expected_cash))
            .map(round_money);
        ShiftSummary {
            shift_id: self.id.clone(),
            opening_cash: round_money(self.opening_cash),
            cash_sales,
            card_sales,
            total_sales: round_money(self.total_sales.unwrap_or(cash_sales + card_sales)),
            order_count: self.order_count.unwrap_or(0),
            expected_cash,
            closing_cash: self.closing_cash.map(round_money),
            variance,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShiftSummary {
    pub shift_id: String,
    pub opening_cash: f64,
    pub cash_sales: f64,
    pub card_sales: f64,
    pub total_sales: f64,
    pub order_count: u64,
    pub expected_cash: f64,
    pub closing_cash: Option<f64>,
    pub variance: Option<f64>,
}

fn parse_shift(value: Value) -> Result<Shift, ApiError> {
    Shift::from_value(value).map_err(ApiError::InvalidJson)
}

/// Shift id remembered from the last start on this machine.
pub fn active_shift_id(db: &DbState) -> Option<String> {
    let conn = db.conn.lock().ok()?;
    db::get_setting(&conn, SHIFT_SETTINGS_CATEGORY, CURRENT_SHIFT_KEY)
}

fn remember_shift(db: &DbState, shift_id: Option<&str>) -> Result<(), ShiftError> {
    let conn = db.conn.lock().map_err(|e| ShiftError::Storage(e.to_string()))?;
    match shift_id {
        Some(id) => db::set_setting(&conn, SHIFT_SETTINGS_CATEGORY, CURRENT_SHIFT_KEY, id),
        None => db::delete_setting(&conn, SHIFT_SETTINGS_CATEGORY, CURRENT_SHIFT_KEY),
    }
    .map_err(ShiftError::Storage)
}

/// The caller's open shift, if any.
pub async fn current_shift(api: &ApiClient) -> Result<Option<Shift>, ApiError> {
    match api.get("/shifts/current").await {
        Ok(Value::Null) => Ok(None),
        Ok(value) => {
            let shift = parse_shift(value)?;
            Ok(shift.is_open().then_some(shift))
        }
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Open a shift with the counted opening float.
pub async fn start_shift(
    api: &ApiClient,
    db: &DbState,
    opening_cash: f64,
) -> Result<Shift, ShiftError> {
    if opening_cash.is_nan() || opening_cash < 0.0 {
        return Err(ShiftError::InvalidAmount);
    }
    if let Some(existing) = current_shift(api).await? {
        remember_shift(db, Some(&existing.id))?;
        return Err(ShiftError::AlreadyOpen(existing.id));
    }

    let mut body = json!({ "openingCash": round_money(opening_cash) });
    if let Some(branch_id) = api.branch_id() {
        body["branchId"] = json!(branch_id);
    }
    let shift = parse_shift(api.post("/shifts/start", body).await?)?;
    remember_shift(db, Some(&shift.id))?;
    info!(shift_id = %shift.id, opening_cash = %opening_cash, "Shift started");
    Ok(shift)
}

/// Close the open shift with the counted drawer cash.
pub async fn end_shift(
    api: &ApiClient,
    db: &DbState,
    closing_cash: f64,
    notes: Option<&str>,
) -> Result<ShiftSummary, ShiftError> {
    if closing_cash.is_nan() || closing_cash < 0.0 {
        return Err(ShiftError::InvalidAmount);
    }
    let Some(open) = current_shift(api).await? else {
        remember_shift(db, None)?;
        return Err(ShiftError::NoOpenShift);
    };

    let path = format!("/shifts/{}/end", segment(&open.id));
    let response = api
        .patch(
            &path,
            json!({ "closingCash": round_money(closing_cash), "notes": notes }),
        )
        .await?;

    // Older backends answer with a bare acknowledgement; fall back to the
    // shift we already hold.
    let mut closed = parse_shift(response).unwrap_or_else(|e| {
        warn!(error = %e, "shift end response unreadable, using local copy");
        open.clone()
    });
    if closed.closing_cash.is_none() {
        closed.closing_cash = Some(closing_cash);
    }

    remember_shift(db, None)?;
    if let Err(e) = flags::take(db, flags::SHIFT_TOTALS_DIRTY) {
        warn!(error = %e, "failed to clear shift totals flag");
    }

    let summary = closed.summary();
    info!(
        shift_id = %closed.id,
        expected = %summary.expected_cash,
        variance = ?summary.variance,
        "Shift closed"
    );
    Ok(summary)
}
