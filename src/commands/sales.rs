use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde_json::{json, Value};
use tracing::{debug, warn};

use counter_pos::admin::{self, ResourceKind};
use counter_pos::cart::{self, Cart, CartLine};
use counter_pos::completion::{self, CompletionRequest};
use counter_pos::models::{CompletionType, PaymentMethod};
use counter_pos::orders;
use counter_pos::payments::PaymentRequest;
use counter_pos::AppContext;

use super::require;

#[derive(Debug, Subcommand)]
pub enum CartCommand {
    /// Show the cart and its totals
    Show {
        /// Re-read the server order first
        #[arg(long)]
        refresh: bool,
    },
    /// Add a product; name and price are looked up when omitted
    Add {
        product_id: String,
        #[arg(long, default_value_t = 1)]
        qty: u32,
        #[arg(long)]
        price: Option<f64>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Change a line's quantity (0 removes it)
    Qty {
        product_id: String,
        quantity: u32,
        /// Notes of the line, when the product is in the cart more than once
        #[arg(long)]
        notes: Option<String>,
    },
    /// Remove a line
    Remove {
        product_id: String,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Attach a customer
    Customer { customer_id: String },
    /// Seat the cart at a table for dine-in
    Table { table_id: String },
    /// Empty the cart
    Clear {
        /// Also cancel the server order
        #[arg(long)]
        cancel: bool,
    },
}

#[derive(Debug, Args)]
pub struct CheckoutArgs {
    /// pickup, delivery or dine-in
    #[arg(long = "type")]
    completion_type: CompletionType,
    /// cash, card or transfer; omit for a dine-in tab left open
    #[arg(long)]
    method: Option<PaymentMethod>,
    /// Cash handed over by the customer
    #[arg(long)]
    tendered: Option<f64>,
    /// Card terminal or transfer reference
    #[arg(long)]
    reference: Option<String>,
    #[arg(long)]
    table: Option<String>,
    #[arg(long)]
    address: Option<String>,
}

/// The register's cart, restored from its snapshot or started fresh with the
/// configured tax rate (or the backend's active taxes when none is set).
async fn load_cart(ctx: &AppContext) -> Result<Cart> {
    if let Some(cart) = cart::load_snapshot(&ctx.db, cart::ACTIVE_SLOT)? {
        return Ok(cart);
    }
    let mut tax_rate = ctx.config.default_tax_rate;
    if tax_rate == 0.0 {
        match admin::active_tax_rate(&ctx.api).await {
            Ok(rate) => tax_rate = rate,
            Err(e) => debug!(error = %e, "no tax rate from backend"),
        }
    }
    Ok(Cart::new(tax_rate))
}

fn cart_view(cart: &Cart) -> Value {
    json!({
        "orderId": cart.order_id,
        "lines": cart.lines,
        "customerId": cart.customer_id,
        "tableId": cart.table_id,
        "totals": cart.totals(),
    })
}

async fn product_line(ctx: &AppContext, product_id: &str, name: Option<String>, price: Option<f64>) -> Result<(String, f64)> {
    if let (Some(name), Some(price)) = (name.clone(), price) {
        return Ok((name, price));
    }
    let product = admin::get(&ctx.api, ResourceKind::Products, product_id)
        .await
        .with_context(|| format!("look up product {product_id}"))?;
    let looked_up_price = ["price", "unitPrice", "basePrice"]
        .iter()
        .find_map(|k| match product.get(*k) {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        });
    let name = name
        .or_else(|| product.get("name").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| product_id.to_string());
    let price = price
        .or(looked_up_price)
        .with_context(|| format!("product {product_id} has no price, pass --price"))?;
    Ok((name, price))
}

pub async fn run_cart(ctx: &AppContext, command: CartCommand) -> Result<Value> {
    require(ctx, "create_order")?;
    let mut cart = load_cart(ctx).await?;

    // Failed remote edits roll the cart back; the snapshot is saved either way.
    let outcome: Result<()> = match command {
        CartCommand::Show { refresh } => {
            if refresh {
                cart::refresh(&ctx.api, &mut cart).await?;
            }
            Ok(())
        }
        CartCommand::Add {
            product_id,
            qty,
            price,
            name,
            notes,
        } => {
            let (name, price) = product_line(ctx, &product_id, name, price).await?;
            let line = CartLine::new(&product_id, &name, qty, price).with_notes(notes);
            cart::add_item(&ctx.api, &mut cart, line).await.map_err(Into::into)
        }
        CartCommand::Qty {
            product_id,
            quantity,
            notes,
        } => cart::update_quantity(&ctx.api, &mut cart, &product_id, notes.as_deref(), quantity)
            .await
            .map_err(Into::into),
        CartCommand::Remove { product_id, notes } => {
            cart::remove_item(&ctx.api, &mut cart, &product_id, notes.as_deref())
                .await
                .map_err(Into::into)
        }
        CartCommand::Customer { customer_id } => {
            cart::assign_customer(&ctx.api, &mut cart, &customer_id)
                .await
                .map_err(Into::into)
        }
        CartCommand::Table { table_id } => {
            cart.table_id = Some(table_id);
            Ok(())
        }
        CartCommand::Clear { cancel } => {
            if cancel {
                if let Some(order_id) = cart.order_id.clone() {
                    orders::cancel_order(&ctx.api, &order_id, Some("cart cleared")).await?;
                }
            }
            cart.clear();
            cart::clear_snapshot(&ctx.db, cart::ACTIVE_SLOT)?;
            return Ok(cart_view(&cart));
        }
    };

    cart::save_snapshot(&ctx.db, cart::ACTIVE_SLOT, &cart)?;
    outcome?;
    Ok(cart_view(&cart))
}

pub async fn checkout(ctx: &AppContext, args: CheckoutArgs) -> Result<Value> {
    let session = require(ctx, "create_order")?;
    if args.method.is_some() {
        session.require("take_payment")?;
    }

    let mut cart = load_cart(ctx).await?;
    let request = CompletionRequest {
        completion_type: args.completion_type,
        payment: args.method.map(|method| PaymentRequest {
            method,
            amount: None,
            tendered: args.tendered,
            reference: args.reference.clone(),
        }),
        table_id: args.table.clone(),
        delivery_address: args.address.clone(),
    };

    match completion::complete_sale(ctx, &mut cart, &request).await {
        Ok(outcome) => Ok(serde_json::to_value(outcome)?),
        Err(e) => {
            // Keep whatever progress the server recorded so a rerun resumes.
            if !cart.is_empty() || cart.order_id.is_some() {
                if let Err(save_err) = cart::save_snapshot(&ctx.db, cart::ACTIVE_SLOT, &cart) {
                    warn!(error = %save_err, "could not save cart after failed checkout");
                }
            }
            Err(e.into())
        }
    }
}
