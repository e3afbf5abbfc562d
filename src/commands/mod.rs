//! Command handlers of the `counter-pos` binary.
//!
//! Each handler runs one operation against the [`AppContext`] and returns
//! the JSON value printed on stdout.

pub mod admin;
pub mod orders;
pub mod sales;
pub mod session;
pub mod settings;
pub mod shifts;
pub mod tables;

use anyhow::{Context, Result};
use counter_pos::auth::Session;
use counter_pos::AppContext;
use serde_json::Value;

/// Current session, failing unless its role grants `permission`.
pub fn require(ctx: &AppContext, permission: &str) -> Result<Session> {
    let session = ctx.session()?;
    session.require(permission)?;
    Ok(session)
}

/// Parse a `--data` argument into a JSON object.
pub fn json_arg(raw: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(raw).context("--data must be valid JSON")?;
    anyhow::ensure!(value.is_object(), "--data must be a JSON object");
    Ok(value)
}
