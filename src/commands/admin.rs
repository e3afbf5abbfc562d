use anyhow::Result;
use clap::{Args, Subcommand};
use serde_json::{json, Value};

use counter_pos::admin::{self, ListQuery, ReservationStatus, ResourceKind};
use counter_pos::AppContext;

use super::{json_arg, require};

#[derive(Debug, Args)]
pub struct AdminArgs {
    /// categories, products, customers, taxes, waiters or reservations
    resource: ResourceKind,
    #[command(subcommand)]
    action: AdminAction,
}

#[derive(Debug, Subcommand)]
pub enum AdminAction {
    List {
        #[arg(long)]
        search: Option<String>,
        #[arg(long)]
        page: Option<u32>,
        #[arg(long)]
        limit: Option<u32>,
    },
    Get {
        id: String,
    },
    Create {
        /// Record as a JSON object
        #[arg(long)]
        data: String,
    },
    Update {
        id: String,
        /// Fields to change as a JSON object
        #[arg(long)]
        data: String,
    },
    Delete {
        id: String,
    },
    /// Change a reservation's status (reservations only)
    Status {
        id: String,
        status: ReservationStatus,
    },
}

#[derive(Debug, Subcommand)]
pub enum BusinessCommand {
    Get,
    Update {
        #[arg(long)]
        data: String,
    },
}

fn manage_permission(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::Categories | ResourceKind::Products => "manage_catalog",
        ResourceKind::Customers => "manage_customers",
        ResourceKind::Taxes => "manage_taxes",
        ResourceKind::Waiters => "manage_staff",
        ResourceKind::Reservations => "manage_reservations",
    }
}

pub async fn run(ctx: &AppContext, args: AdminArgs) -> Result<Value> {
    let kind = args.resource;
    let session = ctx.session()?;
    if !matches!(args.action, AdminAction::List { .. } | AdminAction::Get { .. }) {
        session.require(manage_permission(kind))?;
    }

    match args.action {
        AdminAction::List {
            search,
            page,
            limit,
        } => {
            let query = ListQuery {
                search,
                page,
                limit,
            };
            let records = admin::list(&ctx.api, kind, &query).await?;
            Ok(json!({ "resource": kind.as_str(), "count": records.len(), "items": records }))
        }
        AdminAction::Get { id } => Ok(admin::get(&ctx.api, kind, &id).await?),
        AdminAction::Create { data } => Ok(admin::create(&ctx.api, kind, json_arg(&data)?).await?),
        AdminAction::Update { id, data } => {
            Ok(admin::update(&ctx.api, kind, &id, json_arg(&data)?).await?)
        }
        AdminAction::Delete { id } => {
            admin::delete(&ctx.api, kind, &id).await?;
            Ok(json!({ "deleted": id }))
        }
        AdminAction::Status { id, status } => {
            anyhow::ensure!(
                kind == ResourceKind::Reservations,
                "status changes apply to reservations only"
            );
            Ok(admin::set_reservation_status(&ctx.api, &id, status).await?)
        }
    }
}

pub async fn business(ctx: &AppContext, command: BusinessCommand) -> Result<Value> {
    match command {
        BusinessCommand::Get => {
            ctx.session()?;
            Ok(admin::get_business_settings(&ctx.api).await?)
        }
        BusinessCommand::Update { data } => {
            require(ctx, "manage_business")?;
            Ok(admin::update_business_settings(&ctx.api, json_arg(&data)?).await?)
        }
    }
}

pub async fn dashboard(ctx: &AppContext) -> Result<Value> {
    let session = require(ctx, "view_dashboard")?;
    let branch = ctx
        .api
        .branch_id()
        .map(str::to_string)
        .or_else(|| session.user.branch_id.clone());
    Ok(admin::dashboard_summary(&ctx.api, branch.as_deref()).await?)
}
