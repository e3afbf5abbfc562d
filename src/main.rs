use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info};

use counter_pos::api::ApiClient;
use counter_pos::config::{AppConfig, ConfigOverrides};
use counter_pos::{db, diagnostics, storage, AppContext};

mod commands;

use commands::admin::{AdminArgs, BusinessCommand};
use commands::orders::OrdersCommand;
use commands::sales::{CartCommand, CheckoutArgs};
use commands::settings::SettingsCommand;
use commands::shifts::ShiftCommand;
use commands::tables::TablesCommand;

#[derive(Parser)]
#[command(name = "counter-pos", version)]
#[command(about = "Cashier, table and admin client for the POS REST backend")]
struct Cli {
    /// Backend base URL (overrides COUNTER_POS_API_URL and stored settings)
    #[arg(long, global = true)]
    api_url: Option<String>,
    /// Directory for the local database and logs
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Debug-level logging
    #[arg(long, short = 'v', global = true)]
    verbose: bool,
    /// Write the log file as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Version and build information
    About,
    /// Local state and backend reachability
    Health,
    /// Sign in and remember the session
    Login {
        #[arg(long)]
        email: String,
        #[arg(long, env = "COUNTER_POS_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Forget the stored session
    Logout {
        /// Also forget the remembered backend URL and branch
        #[arg(long)]
        forget_backend: bool,
    },
    /// Show the signed-in user
    Whoami,
    /// Cashier shift
    #[command(subcommand)]
    Shift(ShiftCommand),
    /// The register's cart
    #[command(subcommand)]
    Cart(CartCommand),
    /// Confirm, pay and complete the cart
    Checkout(CheckoutArgs),
    /// Tables and table orders
    #[command(subcommand)]
    Tables(TablesCommand),
    /// Orders and payments
    #[command(subcommand)]
    Orders(OrdersCommand),
    /// Back-office records
    Admin(AdminArgs),
    /// Dashboard summary for the branch
    Dashboard,
    /// Business settings kept by the backend
    #[command(subcommand)]
    Business(BusinessCommand),
    /// Local settings
    #[command(subcommand)]
    Settings(SettingsCommand),
}

fn build_context(cli: &Cli) -> Result<AppContext> {
    let overrides = ConfigOverrides {
        api_url: cli.api_url.clone(),
        data_dir: cli.data_dir.clone(),
    };
    let data_dir = AppConfig::resolve_data_dir(&overrides);
    let db = db::init(&data_dir)
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("open local database in {}", data_dir.display()))?;

    let config = AppConfig::load(&db, &overrides);
    let api_url = config
        .api_url
        .clone()
        .or_else(|| storage::get_credential(storage::KEY_API_URL))
        .unwrap_or_default();
    let mut api = ApiClient::new(&api_url, config.request_timeout())?
        .with_branch(storage::get_credential(storage::KEY_BRANCH_ID));

    let ctx_session = storage::load_session();
    if let Some(session) = &ctx_session {
        api.set_token(Some(session.token().to_string()));
    }
    let ctx = AppContext::new(db, api, config);
    if let Some(session) = ctx_session {
        debug!(user_id = %session.user.id, "restored stored session");
        ctx.auth.set(session);
    }
    Ok(ctx)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let data_dir = AppConfig::resolve_data_dir(&ConfigOverrides {
        api_url: None,
        data_dir: cli.data_dir.clone(),
    });
    let _log_guard = diagnostics::init_logging(
        &diagnostics::get_log_dir(&data_dir),
        cli.verbose,
        cli.log_json,
    )
    .map_err(anyhow::Error::msg)
    .context("initialise logging")?;
    info!("Starting Counter POS v{}", env!("CARGO_PKG_VERSION"));

    let mut ctx = build_context(&cli)?;

    let output = match cli.command {
        Commands::About => commands::session::about(),
        Commands::Health => commands::session::health(&ctx).await?,
        Commands::Login { email, password } => {
            commands::session::login(&mut ctx, &email, &password).await?
        }
        Commands::Logout { forget_backend } => {
            commands::session::logout(&mut ctx, forget_backend)?
        }
        Commands::Whoami => commands::session::whoami(&ctx)?,
        Commands::Shift(command) => commands::shifts::run(&ctx, command).await?,
        Commands::Cart(command) => commands::sales::run_cart(&ctx, command).await?,
        Commands::Checkout(args) => commands::sales::checkout(&ctx, args).await?,
        Commands::Tables(command) => commands::tables::run(&ctx, command).await?,
        Commands::Orders(command) => commands::orders::run(&ctx, command).await?,
        Commands::Admin(args) => commands::admin::run(&ctx, args).await?,
        Commands::Dashboard => commands::admin::dashboard(&ctx).await?,
        Commands::Business(command) => commands::admin::business(&ctx, command).await?,
        Commands::Settings(command) => commands::settings::run(&ctx, command)?,
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn checkout_flags_parse() {
        let cli = Cli::try_parse_from([
            "counter-pos",
            "checkout",
            "--type",
            "dine-in",
            "--method",
            "cash",
            "--tendered",
            "50",
            "--table",
            "t4",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Checkout(_)));
    }

    #[test]
    fn admin_resource_is_validated() {
        assert!(Cli::try_parse_from(["counter-pos", "admin", "products", "list"]).is_ok());
        assert!(Cli::try_parse_from(["counter-pos", "admin", "suppliers", "list"]).is_err());
    }
}
