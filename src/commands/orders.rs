use anyhow::Result;
use clap::Subcommand;
use serde_json::{json, Value};
use tracing::warn;

use counter_pos::orders::{self, OrderFilter};
use counter_pos::{flags, payments, AppContext};

use super::require;

#[derive(Debug, Subcommand)]
pub enum OrdersCommand {
    /// List orders
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        table: Option<String>,
        #[arg(long)]
        shift: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    /// Show one order with its payments
    Show { order_id: String },
    /// Cancel an order
    Cancel {
        order_id: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Refund a payment
    Refund {
        payment_id: String,
        #[arg(long)]
        reason: String,
    },
}

pub async fn run(ctx: &AppContext, command: OrdersCommand) -> Result<Value> {
    require(ctx, "view_orders")?;
    match command {
        OrdersCommand::List {
            status,
            table,
            shift,
            limit,
        } => {
            let filter = OrderFilter {
                status,
                table_id: table,
                shift_id: shift,
                limit: Some(limit),
            };
            let list = orders::list_orders(&ctx.api, &filter).await?;
            if let Err(e) = flags::take(&ctx.db, flags::ORDERS_DIRTY) {
                warn!(error = %e, "failed to clear orders flag");
            }
            Ok(json!({ "count": list.len(), "orders": list }))
        }
        OrdersCommand::Show { order_id } => {
            let order = orders::get_order(&ctx.api, &order_id).await?;
            let paid = payments::list_order_payments(&ctx.api, &order_id).await?;
            Ok(json!({
                "order": order,
                "balanceDue": order.balance_due(),
                "payments": paid,
            }))
        }
        OrdersCommand::Cancel { order_id, reason } => {
            require(ctx, "create_order")?;
            let order = orders::cancel_order(&ctx.api, &order_id, reason.as_deref()).await?;
            flags::raise(&ctx.db, flags::ORDERS_DIRTY, Some(json!({ "orderId": order.id })))
                .map_err(anyhow::Error::msg)?;
            Ok(serde_json::to_value(order)?)
        }
        OrdersCommand::Refund { payment_id, reason } => {
            require(ctx, "refund_payment")?;
            let result = payments::refund_payment(&ctx.api, &payment_id, &reason).await?;
            flags::raise(&ctx.db, flags::SHIFT_TOTALS_DIRTY, None).map_err(anyhow::Error::msg)?;
            Ok(result)
        }
    }
}
