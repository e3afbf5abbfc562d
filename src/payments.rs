//! Payment processing for Counter POS.
//!
//! Payments are posted to `/payments` with an idempotency key so a retried
//! request is deduplicated by the backend. A 409 answer means the backend
//! already holds a payment for the order; the order is re-read and, when it
//! is settled, the attempt is reported as successful.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::{segment, ApiClient, ApiError};
use crate::models::{round_money, Order, Payment, PaymentMethod};
use crate::orders;

/// Tolerance for comparing money values that went through f64 arithmetic.
pub const CENT_EPSILON: f64 = 0.005;

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("Order {0} has nothing left to pay")]
    NothingToPay(String),
    #[error("Amount must be positive")]
    InvalidAmount,
    #[error("Amount {amount:.2} exceeds balance due {balance:.2}")]
    Overpayment { amount: f64, balance: f64 },
    #[error("Cash tendered {tendered:.2} is less than amount due {amount:.2}")]
    InsufficientTender { tendered: f64, amount: f64 },
    #[error("A payment for order {0} already exists but the order is not settled")]
    DuplicatePayment(String),
    #[error(transparent)]
    Api(#[from] ApiError),
}

impl PaymentError {
    /// Whether the backend may have recorded the payment anyway. Only then
    /// must a retry reuse the same idempotency key.
    pub fn is_outcome_unknown(&self) -> bool {
        match self {
            PaymentError::Api(e) => e.is_outcome_unknown(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    pub method: PaymentMethod,
    /// Amount to charge; defaults to the order's balance due.
    #[serde(default)]
    pub amount: Option<f64>,
    /// Cash handed over by the customer.
    #[serde(default)]
    pub tendered: Option<f64>,
    /// Card terminal or transfer reference.
    #[serde(default)]
    pub reference: Option<String>,
}

impl PaymentRequest {
    pub fn cash(tendered: Option<f64>) -> Self {
        Self {
            method: PaymentMethod::Cash,
            amount: None,
            tendered,
            reference: None,
        }
    }

    pub fn card(reference: Option<String>) -> Self {
        Self {
            method: PaymentMethod::Card,
            amount: None,
            tendered: None,
            reference,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentOutcome {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment: Option<Payment>,
    pub amount_charged: f64,
    pub change_due: f64,
    /// The backend already held a settling payment (409 on submit).
    pub already_paid: bool,
}

/// Fresh idempotency key for a payment attempt.
pub fn new_idempotency_key() -> String {
    format!("payment:{}", Uuid::new_v4())
}

/// Work out the amount to charge and the change to hand back.
pub fn resolve_amounts(order: &Order, request: &PaymentRequest) -> Result<(f64, f64), PaymentError> {
    let balance = order.balance_due();
    if balance <= 0.0 {
        return Err(PaymentError::NothingToPay(order.id.clone()));
    }
    let amount = round_money(request.amount.unwrap_or(balance));
    if amount.is_nan() || amount <= 0.0 {
        return Err(PaymentError::InvalidAmount);
    }
    if amount > balance + CENT_EPSILON {
        return Err(PaymentError::Overpayment { amount, balance });
    }

    let change = if request.method.gives_change() {
        let tendered = round_money(request.tendered.unwrap_or(amount));
        if tendered + CENT_EPSILON < amount {
            return Err(PaymentError::InsufficientTender { tendered, amount });
        }
        round_money(tendered - amount)
    } else {
        0.0
    };
    Ok((amount, change))
}

/// Charge an order.
pub async fn process_payment(
    api: &ApiClient,
    order: &Order,
    request: &PaymentRequest,
    idempotency_key: &str,
    shift_id: Option<&str>,
) -> Result<PaymentOutcome, PaymentError> {
    let (amount, change) = resolve_amounts(order, request)?;

    let mut body = json!({
        "orderId": order.id,
        "method": request.method,
        "amount": amount,
    });
    if request.method.gives_change() {
        body["tendered"] = json!(round_money(amount + change));
        body["change"] = json!(change);
    }
    if let Some(reference) = &request.reference {
        body["reference"] = json!(reference);
    }
    if let Some(shift_id) = shift_id {
        body["shiftId"] = json!(shift_id);
    }

    let response = api
        .fetch_with_headers(
            "POST",
            "/payments",
            Some(body),
            &[("Idempotency-Key", idempotency_key.to_string())],
        )
        .await;

    match response {
        Ok(value) => {
            let payment = Payment::from_value(value).ok();
            info!(
                order_id = %order.id,
                method = %request.method,
                amount = %amount,
                change = %change,
                "Payment recorded"
            );
            Ok(PaymentOutcome {
                payment,
                amount_charged: amount,
                change_due: change,
                already_paid: false,
            })
        }
        Err(e) if e.is_conflict() => {
            warn!(order_id = %order.id, error = %e, "payment conflict, re-reading order");
            let current = orders::get_order(api, &order.id).await?;
            if current.is_paid() {
                info!(order_id = %order.id, "order already settled by an earlier payment");
                Ok(PaymentOutcome {
                    payment: None,
                    amount_charged: amount,
                    change_due: change,
                    already_paid: true,
                })
            } else {
                Err(PaymentError::DuplicatePayment(order.id.clone()))
            }
        }
        Err(e) => Err(e.into()),
    }
}

/// All payments recorded against an order.
pub async fn list_order_payments(api: &ApiClient, order_id: &str) -> Result<Vec<Payment>, ApiError> {
    let value = api
        .get(&format!("/orders/{}/payments", segment(order_id)))
        .await?;
    let list = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("payments") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };
    list.into_iter()
        .map(|v| Payment::from_value(v).map_err(ApiError::InvalidJson))
        .collect()
}

pub async fn refund_payment(
    api: &ApiClient,
    payment_id: &str,
    reason: &str,
) -> Result<Value, ApiError> {
    let result = api
        .post(
            &format!("/payments/{}/refund", segment(payment_id)),
            json!({ "reason": reason }),
        )
        .await?;
    info!(payment_id, reason, "Payment refunded");
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::DEFAULT_TIMEOUT;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn order(total: f64) -> Order {
        Order::from_value(json!({ "id": "o1", "total": total })).unwrap()
    }

    #[test]
    fn cash_change_is_computed() {
        let (amount, change) =
            resolve_amounts(&order(17.35), &PaymentRequest::cash(Some(20.0))).unwrap();
        assert_eq!(amount, 17.35);
        assert_eq!(change, 2.65);
    }

    #[test]
    fn card_never_gives_change() {
        let mut req = PaymentRequest::card(None);
        req.tendered = Some(50.0);
        let (_, change) = resolve_amounts(&order(10.0), &req).unwrap();
        assert_eq!(change, 0.0);
    }

    #[test]
    fn rejects_short_tender_overpayment_and_settled_orders() {
        assert!(matches!(
            resolve_amounts(&order(10.0), &PaymentRequest::cash(Some(5.0))),
            Err(PaymentError::InsufficientTender { .. })
        ));

        let mut over = PaymentRequest::card(None);
        over.amount = Some(12.0);
        assert!(matches!(
            resolve_amounts(&order(10.0), &over),
            Err(PaymentError::Overpayment { .. })
        ));

        let paid = Order::from_value(json!({ "id": "o2", "total": 10, "paymentStatus": "PAID" })).unwrap();
        assert!(matches!(
            resolve_amounts(&paid, &PaymentRequest::cash(None)),
            Err(PaymentError::NothingToPay(_))
        ));
    }

    #[tokio::test]
    async fn posts_payment_with_idempotency_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/payments"))
            .and(header("idempotency-key", "payment:k1"))
            .and(body_json(json!({
                "orderId": "o1", "method": "CASH", "amount": 8.5,
                "tendered": 10.0, "change": 1.5, "shiftId": "s1"
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "pay-1", "orderId": "o1", "method": "CASH", "amount": 8.5
            })))
            .mount(&server)
            .await;

        let api = ApiClient::new(&server.uri(), DEFAULT_TIMEOUT).unwrap();
        let outcome = process_payment(
            &api,
            &order(8.5),
            &PaymentRequest::cash(Some(10.0)),
            "payment:k1",
            Some("s1"),
        )
        .await
        .unwrap();
        assert_eq!(outcome.change_due, 1.5);
        assert!(!outcome.already_paid);
        assert_eq!(outcome.payment.unwrap().id.as_deref(), Some("pay-1"));
    }

    #[tokio::test]
    async fn conflict_on_settled_order_is_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/payments"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({ "message": "duplicate" })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/orders/o1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "o1", "total": 8.5, "paymentStatus": "PAID"
            })))
            .mount(&server)
            .await;

        let api = ApiClient::new(&server.uri(), DEFAULT_TIMEOUT).unwrap();
        let outcome = process_payment(&api, &order(8.5), &PaymentRequest::card(None), "k", None)
            .await
            .unwrap();
        assert!(outcome.already_paid);
        assert!(outcome.payment.is_none());
    }

    #[tokio::test]
    async fn conflict_on_unsettled_order_is_duplicate_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/payments"))
            .respond_with(ResponseTemplate::new(409))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/orders/o1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "o1", "total": 8.5, "paymentStatus": "UNPAID"
            })))
            .mount(&server)
            .await;

        let api = ApiClient::new(&server.uri(), DEFAULT_TIMEOUT).unwrap();
        let err = process_payment(&api, &order(8.5), &PaymentRequest::card(None), "k", None)
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::DuplicatePayment(id) if id == "o1"));
    }
}
