use anyhow::{Context, Result};
use serde_json::{json, Value};
use tracing::{info, warn};

use counter_pos::{auth, diagnostics, storage, AppContext};

pub async fn login(ctx: &mut AppContext, email: &str, password: &str) -> Result<Value> {
    anyhow::ensure!(
        !ctx.api.base_url().is_empty(),
        "backend URL is not configured (use --api-url or COUNTER_POS_API_URL)"
    );
    let session = auth::login(&ctx.api, email, password).await?;

    if let Err(e) = storage::set_credential(storage::KEY_API_URL, ctx.api.base_url()) {
        warn!(error = %e, "could not remember backend URL");
    }
    if let Err(e) = storage::store_session(&session) {
        warn!(error = %e, "could not persist session, it will last for this run only");
    }

    ctx.api.set_token(Some(session.token().to_string()));
    let view = session.to_user_json();
    auth::begin_session(&ctx.auth, &ctx.db, session)?;
    Ok(view)
}

pub fn logout(ctx: &mut AppContext, forget_backend: bool) -> Result<Value> {
    auth::logout(&ctx.auth, &ctx.db)?;
    let cleared = if forget_backend {
        storage::factory_reset()
    } else {
        storage::clear_session()
    };
    cleared
        .map_err(anyhow::Error::msg)
        .context("clear stored credentials")?;
    ctx.api.set_token(None);
    info!(forget_backend, "logged out");
    Ok(json!({ "loggedOut": true, "backendForgotten": forget_backend }))
}

pub fn whoami(ctx: &AppContext) -> Result<Value> {
    Ok(ctx.session()?.to_user_json())
}

pub fn about() -> Value {
    diagnostics::about_info()
}

pub async fn health(ctx: &AppContext) -> Result<Value> {
    let api = (!ctx.api.base_url().is_empty()).then_some(&ctx.api);
    let mut report = diagnostics::system_health(&ctx.db, api)
        .await
        .map_err(anyhow::Error::msg)?;
    report["session"] = match ctx.session() {
        Ok(session) => json!({ "userId": session.user.id, "role": session.user.role }),
        Err(e) => json!({ "error": e.to_string() }),
    };
    report["config"] = serde_json::to_value(&ctx.config)?;
    report["backendRemembered"] = json!(storage::is_configured());
    Ok(report)
}
