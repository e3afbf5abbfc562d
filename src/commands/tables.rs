use anyhow::{Context, Result};
use clap::Subcommand;
use serde_json::{json, Value};

use counter_pos::models::PaymentMethod;
use counter_pos::payments::PaymentRequest;
use counter_pos::tables::{self, TableBoard};
use counter_pos::{shifts, AppContext};

use super::require;

#[derive(Debug, Subcommand)]
pub enum TablesCommand {
    /// Floor plan with table statuses
    List,
    /// A table and its open table order
    Show { table_id: String },
    /// Seat guests at a table
    Open {
        table_id: String,
        #[arg(long)]
        guests: Option<u32>,
        #[arg(long)]
        waiter: Option<String>,
    },
    /// Pay and close a table order
    Close {
        table_order_id: String,
        #[arg(long)]
        method: Option<PaymentMethod>,
        #[arg(long)]
        tendered: Option<f64>,
        #[arg(long)]
        reference: Option<String>,
    },
    /// Move a table order to another table
    Transfer {
        table_order_id: String,
        to_table_id: String,
    },
    /// QR code image URL for a table's menu link
    Qr {
        table_id: String,
        /// Public menu site, e.g. https://menu.example.com
        #[arg(long)]
        menu_url: String,
    },
}

pub async fn run(ctx: &AppContext, command: TablesCommand) -> Result<Value> {
    require(ctx, "manage_tables")?;
    match command {
        TablesCommand::List => {
            let mut board = TableBoard::new();
            board.refresh_if_needed(&ctx.api, &ctx.db).await?;
            Ok(serde_json::to_value(board)?)
        }
        TablesCommand::Show { table_id } => {
            let table_order = tables::get_active_table_order(&ctx.api, &table_id).await?;
            let totals = table_order.as_ref().map(|t| t.totals());
            Ok(json!({ "tableId": table_id, "tableOrder": table_order, "totals": totals }))
        }
        TablesCommand::Open {
            table_id,
            guests,
            waiter,
        } => {
            if let Some(existing) = tables::get_active_table_order(&ctx.api, &table_id).await? {
                anyhow::bail!("table {table_id} already has open table order {}", existing.id);
            }
            let table_order =
                tables::open_table_order(&ctx.api, &table_id, guests, waiter.as_deref()).await?;
            Ok(serde_json::to_value(table_order)?)
        }
        TablesCommand::Close {
            table_order_id,
            method,
            tendered,
            reference,
        } => {
            let payment = method.map(|method| PaymentRequest {
                method,
                amount: None,
                tendered,
                reference,
            });
            if payment.is_some() {
                require(ctx, "take_payment")?;
            }
            let shift_id = shifts::active_shift_id(&ctx.db);
            let outcome = tables::close_table_order(
                &ctx.api,
                &ctx.db,
                &table_order_id,
                payment.as_ref(),
                shift_id.as_deref(),
            )
            .await?;
            Ok(serde_json::to_value(outcome)?)
        }
        TablesCommand::Transfer {
            table_order_id,
            to_table_id,
        } => {
            let table_order =
                tables::transfer_table_order(&ctx.api, &table_order_id, &to_table_id).await?;
            Ok(serde_json::to_value(table_order)?)
        }
        TablesCommand::Qr { table_id, menu_url } => {
            let all = tables::list_tables(&ctx.api).await?;
            let table = all
                .iter()
                .find(|t| t.id == table_id)
                .with_context(|| format!("unknown table {table_id}"))?;
            let url = tables::qr_code_url(table, &menu_url)?;
            Ok(json!({ "tableId": table.id, "name": table.name, "qrUrl": url }))
        }
    }
}
