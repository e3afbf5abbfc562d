use anyhow::Result;
use clap::Subcommand;
use serde_json::{json, Value};

use counter_pos::{config, db, AppContext};

#[derive(Debug, Subcommand)]
pub enum SettingsCommand {
    /// Show stored settings of a category (default: app)
    Get {
        #[arg(default_value = config::SETTINGS_CATEGORY)]
        category: String,
        key: Option<String>,
    },
    /// Store a setting, e.g. `settings set app currency EUR`
    Set {
        category: String,
        key: String,
        value: String,
    },
    /// Remove a stored setting
    Unset { category: String, key: String },
}

pub fn run(ctx: &AppContext, command: SettingsCommand) -> Result<Value> {
    let conn = ctx
        .db
        .conn
        .lock()
        .map_err(|e| anyhow::anyhow!("database lock poisoned: {e}"))?;
    match command {
        SettingsCommand::Get {
            category,
            key: Some(key),
        } => Ok(json!({
            "category": category,
            "key": key,
            "value": db::get_setting(&conn, &category, &key),
        })),
        SettingsCommand::Get {
            category,
            key: None,
        } => Ok(db::get_category_settings(&conn, &category)),
        SettingsCommand::Set {
            category,
            key,
            value,
        } => {
            db::set_setting(&conn, &category, &key, &value).map_err(anyhow::Error::msg)?;
            Ok(json!({ "category": category, "key": key, "value": value }))
        }
        SettingsCommand::Unset { category, key } => {
            db::delete_setting(&conn, &category, &key).map_err(anyhow::Error::msg)?;
            Ok(json!({ "category": category, "key": key, "removed": true }))
        }
    }
}
