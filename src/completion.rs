//! Sale completion: turn the cart into a settled, completed order.
//!
//! The backend needs several calls to finish a sale and any of them can
//! fail halfway. Each step is skipped when the server state already shows it
//! done, and the cart (with its order id and payment idempotency key) is
//! persisted before money moves, so running the completion again after a
//! failure resumes where it stopped instead of charging twice.

use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::api::ApiError;
use crate::cart::{self, Cart, CartError};
use crate::flags;
use crate::models::{round_money, CompletionType, Order, OrderStatus, PaymentStatus};
use crate::orders::{self, CompletionDetails};
use crate::payments::{self, PaymentError, PaymentRequest};
use crate::shifts;
use crate::tables;
use crate::AppContext;

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("Cart is empty")]
    EmptyCart,
    #[error("Dine-in orders need a table")]
    TableRequired,
    #[error("Delivery orders need a delivery address")]
    AddressRequired,
    #[error("A payment is required to complete a {0} order")]
    PaymentRequired(CompletionType),
    #[error("Open a shift before taking sales")]
    ShiftRequired,
    #[error("Order {0} was cancelled")]
    OrderCancelled(String),
    #[error(transparent)]
    Cart(#[from] CartError),
    #[error(transparent)]
    Payment(#[from] PaymentError),
    #[error(transparent)]
    Api(#[from] ApiError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub completion_type: CompletionType,
    pub payment: Option<PaymentRequest>,
    /// Table for dine-in; defaults to the cart's table.
    pub table_id: Option<String>,
    pub delivery_address: Option<String>,
}

impl CompletionRequest {
    pub fn new(completion_type: CompletionType, payment: Option<PaymentRequest>) -> Self {
        Self {
            completion_type,
            payment,
            table_id: None,
            delivery_address: None,
        }
    }
}

/// A step that was actually performed against the backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum CompletionStep {
    OrderCreated { order_id: String },
    Confirmed,
    AttachedToTable { table_order_id: String },
    Paid { amount: f64 },
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionOutcome {
    pub order: Order,
    pub steps: Vec<CompletionStep>,
    pub change_due: f64,
    /// The payment had already been taken by an earlier attempt.
    pub already_paid: bool,
    /// Still owed after this run. A partial payment leaves the order open.
    pub balance_due: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table_order_id: Option<String>,
}

fn validate(
    cart: &Cart,
    request: &CompletionRequest,
    table_id: Option<&str>,
) -> Result<(), CompletionError> {
    if cart.is_empty() {
        return Err(CompletionError::EmptyCart);
    }
    match request.completion_type {
        CompletionType::DineIn if table_id.is_none() => return Err(CompletionError::TableRequired),
        CompletionType::Delivery
            if request
                .delivery_address
                .as_deref()
                .map_or(true, |a| a.trim().is_empty()) =>
        {
            return Err(CompletionError::AddressRequired)
        }
        _ => {}
    }
    let server_paid = cart.server.as_ref().map_or(false, Order::is_paid);
    if request.completion_type != CompletionType::DineIn
        && request.payment.is_none()
        && !server_paid
    {
        return Err(CompletionError::PaymentRequired(request.completion_type));
    }
    Ok(())
}

/// Shift to attribute the sale to. Falls back to asking the server when
/// this machine has no record of one.
async fn resolve_shift(ctx: &AppContext) -> Result<Option<String>, CompletionError> {
    if let Some(id) = shifts::active_shift_id(&ctx.db) {
        return Ok(Some(id));
    }
    let server_shift = shifts::current_shift(&ctx.api).await?.map(|s| s.id);
    if server_shift.is_none() && ctx.config.require_open_shift {
        return Err(CompletionError::ShiftRequired);
    }
    Ok(server_shift)
}

fn persist(ctx: &AppContext, cart: &Cart) -> Result<(), CompletionError> {
    cart::save_snapshot(&ctx.db, cart::ACTIVE_SLOT, cart)?;
    Ok(())
}

fn raise_flag(ctx: &AppContext, flag: &str, order: &Order) {
    let payload = json!({ "orderId": order.id, "completionType": order.completion_type });
    if let Err(e) = flags::raise(&ctx.db, flag, Some(payload)) {
        warn!(flag, error = %e, "failed to raise refresh flag");
    }
}

/// Run the sale flow for `cart`: validate, create, confirm, seat (dine-in),
/// pay, complete. On success the cart is reset and its snapshot removed.
///
/// A dine-in sale without a payment stays open on the table and is settled
/// later when the table order is closed.
pub async fn complete_sale(
    ctx: &AppContext,
    cart: &mut Cart,
    request: &CompletionRequest,
) -> Result<CompletionOutcome, CompletionError> {
    let completion_type = request.completion_type;
    let table_id = request.table_id.clone().or_else(|| cart.table_id.clone());
    validate(cart, request, table_id.as_deref())?;
    let shift_id = resolve_shift(ctx).await?;

    let mut steps = Vec::new();

    // Server order
    let mut order = match cart.order_id.clone() {
        Some(order_id) => orders::get_order(&ctx.api, &order_id).await?,
        None => {
            let mut draft = cart.to_draft();
            draft.completion_type = Some(completion_type);
            draft.shift_id = shift_id.clone();
            if completion_type == CompletionType::DineIn {
                draft.table_id = table_id.clone();
            }
            let created = orders::create_order(&ctx.api, &draft).await?;
            steps.push(CompletionStep::OrderCreated {
                order_id: created.id.clone(),
            });
            created
        }
    };
    cart.reconcile(order.clone());
    persist(ctx, cart)?;

    if order.status == OrderStatus::Cancelled {
        return Err(CompletionError::OrderCancelled(order.id));
    }
    let already_completed = order.status == OrderStatus::Completed;

    // Confirm
    if !order.status.is_confirmed_or_later() {
        order = orders::confirm_order(&ctx.api, &order.id).await?;
        steps.push(CompletionStep::Confirmed);
    }

    // Seat at the table
    let mut table_order_id = order.table_order_id.clone();
    if completion_type == CompletionType::DineIn && table_order_id.is_none() && !already_completed {
        if let Some(table_id) = table_id.as_deref() {
            let table_order = tables::active_or_open(&ctx.api, table_id).await?;
            tables::attach_order(&ctx.api, &table_order.id, &order.id).await?;
            order.table_order_id = Some(table_order.id.clone());
            steps.push(CompletionStep::AttachedToTable {
                table_order_id: table_order.id.clone(),
            });
            table_order_id = Some(table_order.id);
        }
    }

    // Pay
    let mut change_due = 0.0;
    let mut already_paid = order.is_paid();
    let mut took_payment = false;
    match &request.payment {
        Some(payment) if !order.is_paid() && order.balance_due() > 0.0 => {
            let key = cart
                .payment_attempt_key
                .get_or_insert_with(payments::new_idempotency_key)
                .clone();
            persist(ctx, cart)?;
            let outcome =
                match payments::process_payment(&ctx.api, &order, payment, &key, shift_id.as_deref())
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        // A declined or rejected payment gets a fresh key so the
                        // cashier can retry with another method or tender.
                        if !e.is_outcome_unknown() {
                            cart.payment_attempt_key = None;
                            if let Err(save_err) = persist(ctx, cart) {
                                warn!(error = %save_err, "failed to save cart after rejected payment");
                            }
                        }
                        return Err(e.into());
                    }
                };
            cart.payment_attempt_key = None;
            change_due = outcome.change_due;
            already_paid = outcome.already_paid;
            took_payment = true;
            steps.push(CompletionStep::Paid {
                amount: outcome.amount_charged,
            });

            if !outcome.already_paid {
                let paid_so_far = order.amount_paid.unwrap_or(0.0) + outcome.amount_charged;
                let remaining = round_money(order.effective_total() - paid_so_far);
                order.amount_paid = Some(round_money(paid_so_far));
                order.payment_status = if remaining > payments::CENT_EPSILON {
                    PaymentStatus::PartiallyPaid
                } else {
                    PaymentStatus::Paid
                };
            } else {
                order.payment_status = PaymentStatus::Paid;
            }
        }
        None if completion_type != CompletionType::DineIn && !order.is_paid() => {
            return Err(CompletionError::PaymentRequired(completion_type));
        }
        _ => debug!(order_id = %order.id, "no payment needed"),
    }

    let balance_due = order.balance_due();
    if took_payment && balance_due > payments::CENT_EPSILON && !already_completed {
        cart.reconcile(order.clone());
        persist(ctx, cart)?;
        raise_flag(ctx, flags::SHIFT_TOTALS_DIRTY, &order);
        raise_flag(ctx, flags::ORDERS_DIRTY, &order);
        info!(order_id = %order.id, balance_due = %balance_due, "Order partly paid, left open");
        return Ok(CompletionOutcome {
            order,
            steps,
            change_due,
            already_paid,
            balance_due,
            table_order_id,
        });
    }

    // Complete
    let leave_open = completion_type == CompletionType::DineIn && request.payment.is_none();
    if !already_completed && !leave_open {
        let details = CompletionDetails {
            completion_type,
            table_id: (completion_type == CompletionType::DineIn)
                .then(|| table_id.clone())
                .flatten(),
            delivery_address: (completion_type == CompletionType::Delivery)
                .then(|| request.delivery_address.clone())
                .flatten(),
        };
        order = orders::complete_order(&ctx.api, &order.id, &details).await?;
        steps.push(CompletionStep::Completed);
    }

    raise_flag(ctx, flags::ORDER_COMPLETED, &order);
    raise_flag(ctx, flags::ORDERS_DIRTY, &order);
    if completion_type == CompletionType::DineIn {
        raise_flag(ctx, flags::TABLES_DIRTY, &order);
    }
    if took_payment || already_paid {
        raise_flag(ctx, flags::SHIFT_TOTALS_DIRTY, &order);
    }

    if let Err(e) = cart::clear_snapshot(&ctx.db, cart::ACTIVE_SLOT) {
        warn!(error = %e, "failed to clear cart snapshot");
    }
    cart.clear();

    info!(
        order_id = %order.id,
        completion_type = %completion_type,
        steps = steps.len(),
        change = %change_due,
        "Sale completed"
    );
    let balance_due = order.balance_due();
    Ok(CompletionOutcome {
        order,
        steps,
        change_due,
        already_paid,
        balance_due,
        table_order_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiClient, DEFAULT_TIMEOUT};
    use crate::cart::CartLine;
    use crate::config::AppConfig;
    use crate::db;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn context(server: &MockServer) -> AppContext {
        let config = AppConfig {
            require_open_shift: false,
            ..AppConfig::default()
        };
        AppContext::new(
            db::open_in_memory_for_test(),
            ApiClient::new(&server.uri(), DEFAULT_TIMEOUT).unwrap(),
            config,
        )
    }

    fn coffee_cart() -> Cart {
        let mut cart = Cart::new(0.0);
        cart.add_line(CartLine::new("p1", "Coffee", 2, 3.5)).unwrap();
        cart
    }

    async fn mount_no_shift(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/shifts/current"))
            .respond_with(ResponseTemplate::new(404))
            .mount(server)
            .await;
    }

    fn order_body(status: &str, payment_status: &str) -> serde_json::Value {
        json!({
            "id": "o1",
            "status": status,
            "paymentStatus": payment_status,
            "items": [{ "productId": "p1", "name": "Coffee", "quantity": 2, "unitPrice": 3.5 }],
            "total": 7.0
        })
    }

    #[test]
    fn validation_rejects_incomplete_requests() {
        let cart = coffee_cart();
        let dine_in = CompletionRequest::new(CompletionType::DineIn, None);
        assert!(matches!(validate(&cart, &dine_in, None), Err(CompletionError::TableRequired)));

        let delivery = CompletionRequest::new(CompletionType::Delivery, Some(PaymentRequest::cash(None)));
        assert!(matches!(
            validate(&cart, &delivery, None),
            Err(CompletionError::AddressRequired)
        ));

        let pickup = CompletionRequest::new(CompletionType::Pickup, None);
        assert!(matches!(
            validate(&cart, &pickup, None),
            Err(CompletionError::PaymentRequired(CompletionType::Pickup))
        ));

        assert!(matches!(
            validate(&Cart::new(0.0), &pickup, None),
            Err(CompletionError::EmptyCart)
        ));
        assert!(validate(&cart, &dine_in, Some("t1")).is_ok());
    }

    #[test]
    fn emptied_cart_with_server_order_is_rejected() {
        let mut cart = coffee_cart();
        cart.order_id = Some("o1".into());
        cart.reconcile(Order::from_value(json!({ "id": "o1", "status": "PENDING", "items": [] })).unwrap());
        assert!(cart.is_empty());

        let pickup = CompletionRequest::new(CompletionType::Pickup, Some(PaymentRequest::cash(None)));
        assert!(matches!(
            validate(&cart, &pickup, None),
            Err(CompletionError::EmptyCart)
        ));
    }

    #[tokio::test]
    async fn declined_payment_gets_a_fresh_key_on_retry() {
        let server = MockServer::start().await;
        mount_no_shift(&server).await;
        Mock::given(method("GET"))
            .and(path("/orders/o1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(order_body("CONFIRMED", "UNPAID")))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/payments"))
            .and(body_partial_json(json!({ "method": "CARD" })))
            .respond_with(ResponseTemplate::new(402).set_body_json(json!({ "message": "Card declined" })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/payments"))
            .and(body_partial_json(json!({ "method": "CASH" })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "pay2", "amount": 7 })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/orders/o1/complete"))
            .respond_with(ResponseTemplate::new(200).set_body_json(order_body("COMPLETED", "PAID")))
            .expect(1)
            .mount(&server)
            .await;

        let ctx = context(&server);
        let mut cart = coffee_cart();
        cart.order_id = Some("o1".into());

        let card = CompletionRequest::new(CompletionType::Pickup, Some(PaymentRequest::card(None)));
        let err = complete_sale(&ctx, &mut cart, &card).await.unwrap_err();
        assert!(matches!(err, CompletionError::Payment(PaymentError::Api(ref e)) if e.status() == Some(402)));
        assert!(cart.payment_attempt_key.is_none());
        let saved = cart::load_snapshot(&ctx.db, cart::ACTIVE_SLOT).unwrap().unwrap();
        assert!(saved.payment_attempt_key.is_none());

        let cash = CompletionRequest::new(CompletionType::Pickup, Some(PaymentRequest::cash(Some(10.0))));
        let outcome = complete_sale(&ctx, &mut cart, &cash).await.unwrap();
        assert_eq!(outcome.change_due, 3.0);

        let keys: Vec<String> = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter(|r| r.url.path() == "/payments")
            .filter_map(|r| r.headers.get("idempotency-key"))
            .filter_map(|v| v.to_str().ok().map(str::to_string))
            .collect();
        assert_eq!(keys.len(), 2);
        assert_ne!(keys[0], keys[1]);
    }

    #[tokio::test]
    async fn partial_payment_leaves_order_open() {
        let server = MockServer::start().await;
        mount_no_shift(&server).await;
        Mock::given(method("GET"))
            .and(path("/orders/o1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "o1",
                "status": "CONFIRMED",
                "paymentStatus": "UNPAID",
                "items": [{ "productId": "p1", "name": "Coffee", "quantity": 2, "unitPrice": 5.0 }],
                "total": 10.0
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/payments"))
            .and(body_partial_json(json!({ "amount": 4.0 })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "pay1", "amount": 4 })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/orders/o1/complete"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let ctx = context(&server);
        let mut cart = coffee_cart();
        cart.order_id = Some("o1".into());
        let mut payment = PaymentRequest::card(None);
        payment.amount = Some(4.0);
        let request = CompletionRequest::new(CompletionType::Pickup, Some(payment));
        let outcome = complete_sale(&ctx, &mut cart, &request).await.unwrap();

        assert_eq!(outcome.steps, vec![CompletionStep::Paid { amount: 4.0 }]);
        assert_eq!(outcome.balance_due, 6.0);
        assert_eq!(outcome.order.payment_status, PaymentStatus::PartiallyPaid);
        assert_eq!(cart.order_id.as_deref(), Some("o1"));
        assert!(cart.payment_attempt_key.is_none());
        assert!(cart::load_snapshot(&ctx.db, cart::ACTIVE_SLOT).unwrap().is_some());
        assert!(flags::peek(&ctx.db, flags::ORDER_COMPLETED).unwrap().is_none());
        assert!(flags::peek(&ctx.db, flags::SHIFT_TOTALS_DIRTY).unwrap().is_some());
    }

    #[tokio::test]
    async fn shift_is_required_when_configured() {
        let server = MockServer::start().await;
        mount_no_shift(&server).await;
        let mut ctx = context(&server);
        ctx.config.require_open_shift = true;

        let mut cart = coffee_cart();
        let request = CompletionRequest::new(CompletionType::Pickup, Some(PaymentRequest::cash(None)));
        let err = complete_sale(&ctx, &mut cart, &request).await.unwrap_err();
        assert!(matches!(err, CompletionError::ShiftRequired));
        assert_eq!(cart.item_count(), 2);
    }

    #[tokio::test]
    async fn pickup_sale_runs_every_step() {
        let server = MockServer::start().await;
        mount_no_shift(&server).await;
        Mock::given(method("POST"))
            .and(path("/orders"))
            .and(body_partial_json(json!({ "completionType": "PICKUP" })))
            .respond_with(ResponseTemplate::new(201).set_body_json(order_body("PENDING", "UNPAID")))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/orders/o1/confirm"))
            .respond_with(ResponseTemplate::new(200).set_body_json(order_body("CONFIRMED", "UNPAID")))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/payments"))
            .and(body_partial_json(json!({ "orderId": "o1", "amount": 7.0, "change": 3.0 })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "pay1", "amount": 7 })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/orders/o1/complete"))
            .and(body_partial_json(json!({ "completionType": "PICKUP" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(order_body("COMPLETED", "PAID")))
            .expect(1)
            .mount(&server)
            .await;

        let ctx = context(&server);
        let mut cart = coffee_cart();
        let request = CompletionRequest::new(CompletionType::Pickup, Some(PaymentRequest::cash(Some(10.0))));
        let outcome = complete_sale(&ctx, &mut cart, &request).await.unwrap();

        assert_eq!(outcome.change_due, 3.0);
        assert_eq!(outcome.order.status, OrderStatus::Completed);
        assert_eq!(
            outcome.steps,
            vec![
                CompletionStep::OrderCreated { order_id: "o1".into() },
                CompletionStep::Confirmed,
                CompletionStep::Paid { amount: 7.0 },
                CompletionStep::Completed,
            ]
        );
        assert!(cart.is_empty() && cart.order_id.is_none());
        assert!(cart::load_snapshot(&ctx.db, cart::ACTIVE_SLOT).unwrap().is_none());
        assert!(flags::peek(&ctx.db, flags::ORDER_COMPLETED).unwrap().is_some());
        assert!(flags::peek(&ctx.db, flags::SHIFT_TOTALS_DIRTY).unwrap().is_some());
        assert!(flags::peek(&ctx.db, flags::TABLES_DIRTY).unwrap().is_none());
    }

    #[tokio::test]
    async fn retry_after_failed_completion_skips_payment() {
        let server = MockServer::start().await;
        mount_no_shift(&server).await;
        Mock::given(method("GET"))
            .and(path("/orders/o1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(order_body("CONFIRMED", "PAID")))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/payments"))
            .respond_with(ResponseTemplate::new(201))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/orders/o1/complete"))
            .respond_with(ResponseTemplate::new(200).set_body_json(order_body("COMPLETED", "PAID")))
            .expect(1)
            .mount(&server)
            .await;

        let ctx = context(&server);
        let mut cart = coffee_cart();
        cart.order_id = Some("o1".into());
        cart.payment_attempt_key = Some("payment:first-try".into());
        let request = CompletionRequest::new(CompletionType::Pickup, Some(PaymentRequest::card(None)));
        let outcome = complete_sale(&ctx, &mut cart, &request).await.unwrap();

        assert_eq!(outcome.steps, vec![CompletionStep::Completed]);
        assert!(outcome.already_paid);
    }

    #[tokio::test]
    async fn payment_reuses_persisted_idempotency_key() {
        let server = MockServer::start().await;
        mount_no_shift(&server).await;
        Mock::given(method("GET"))
            .and(path("/orders/o1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(order_body("CONFIRMED", "UNPAID")))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/payments"))
            .and(header("idempotency-key", "payment:first-try"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let ctx = context(&server);
        let mut cart = coffee_cart();
        cart.order_id = Some("o1".into());
        cart.payment_attempt_key = Some("payment:first-try".into());
        let request = CompletionRequest::new(CompletionType::Pickup, Some(PaymentRequest::card(None)));
        let err = complete_sale(&ctx, &mut cart, &request).await.unwrap_err();
        assert!(matches!(err, CompletionError::Payment(PaymentError::Api(_))));

        let saved = cart::load_snapshot(&ctx.db, cart::ACTIVE_SLOT).unwrap().unwrap();
        assert_eq!(saved.order_id.as_deref(), Some("o1"));
        assert_eq!(saved.payment_attempt_key.as_deref(), Some("payment:first-try"));
    }

    #[tokio::test]
    async fn dine_in_without_payment_stays_open_on_table() {
        let server = MockServer::start().await;
        mount_no_shift(&server).await;
        Mock::given(method("POST"))
            .and(path("/orders"))
            .and(body_partial_json(json!({ "tableId": "t1", "completionType": "DINE_IN" })))
            .respond_with(ResponseTemplate::new(201).set_body_json(order_body("PENDING", "UNPAID")))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/orders/o1/confirm"))
            .respond_with(ResponseTemplate::new(200).set_body_json(order_body("CONFIRMED", "UNPAID")))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/table-orders"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/table-orders"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": "to1", "tableId": "t1", "status": "OPEN"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/table-orders/to1/orders"))
            .and(body_partial_json(json!({ "orderId": "o1" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "to1", "tableId": "t1", "orders": ["o1"]
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/orders/o1/complete"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let ctx = context(&server);
        let mut cart = coffee_cart();
        cart.table_id = Some("t1".into());
        let request = CompletionRequest::new(CompletionType::DineIn, None);
        let outcome = complete_sale(&ctx, &mut cart, &request).await.unwrap();

        assert_eq!(outcome.table_order_id.as_deref(), Some("to1"));
        assert_eq!(outcome.order.status, OrderStatus::Confirmed);
        assert!(outcome.steps.contains(&CompletionStep::AttachedToTable {
            table_order_id: "to1".into()
        }));
        assert!(!outcome.steps.contains(&CompletionStep::Completed));
        assert!(flags::peek(&ctx.db, flags::TABLES_DIRTY).unwrap().is_some());
        assert!(flags::peek(&ctx.db, flags::SHIFT_TOTALS_DIRTY).unwrap().is_none());
    }
}
