use anyhow::Result;
use clap::Subcommand;
use serde_json::{json, Value};

use counter_pos::{flags, shifts, AppContext};

use super::require;

#[derive(Debug, Subcommand)]
pub enum ShiftCommand {
    /// Open a shift with the counted opening float
    Start {
        #[arg(long, default_value_t = 0.0)]
        opening_cash: f64,
    },
    /// Show the open shift and its running cash summary
    Current,
    /// Close the open shift with the counted drawer cash
    End {
        #[arg(long)]
        closing_cash: f64,
        #[arg(long)]
        notes: Option<String>,
    },
}

pub async fn run(ctx: &AppContext, command: ShiftCommand) -> Result<Value> {
    require(ctx, "manage_shift")?;
    match command {
        ShiftCommand::Start { opening_cash } => {
            let shift = shifts::start_shift(&ctx.api, &ctx.db, opening_cash).await?;
            Ok(serde_json::to_value(shift)?)
        }
        ShiftCommand::Current => {
            let shift = shifts::current_shift(&ctx.api).await?;
            let totals_stale = flags::take(&ctx.db, flags::SHIFT_TOTALS_DIRTY)
                .map_err(anyhow::Error::msg)?
                .is_some();
            Ok(json!({
                "shift": shift,
                "summary": shift.as_ref().map(|s| s.summary()),
                "refreshedAfterSale": totals_stale,
            }))
        }
        ShiftCommand::End {
            closing_cash,
            notes,
        } => {
            let summary = shifts::end_shift(&ctx.api, &ctx.db, closing_cash, notes.as_deref()).await?;
            Ok(serde_json::to_value(summary)?)
        }
    }
}
