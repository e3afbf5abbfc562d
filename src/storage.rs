//! Secure session storage using the OS credential store.
//!
//! On Windows this uses the Credential Manager (via the `keyring` crate), on
//! macOS Keychain, and on Linux the Secret Service API. The bearer token and
//! the backend URL never touch the SQLite database.

use keyring::Entry;
use tracing::{info, warn};

use crate::auth::{Session, SessionUser};

const SERVICE_NAME: &str = "counter-pos";

// Credential keys
pub const KEY_API_URL: &str = "api_url";
pub const KEY_AUTH_TOKEN: &str = "auth_token";
pub const KEY_SESSION_USER: &str = "session_user";
pub const KEY_BRANCH_ID: &str = "branch_id";

/// Keys tied to a login session.
const SESSION_KEYS: &[&str] = &[KEY_AUTH_TOKEN, KEY_SESSION_USER];

/// All credential keys managed by this module.
const ALL_KEYS: &[&str] = &[KEY_API_URL, KEY_AUTH_TOKEN, KEY_SESSION_USER, KEY_BRANCH_ID];

// ---------------------------------------------------------------------------
// Low-level helpers
// ---------------------------------------------------------------------------

/// Retrieve a single credential from the OS keyring. Returns `None` when the
/// entry does not exist (or the platform returns a "not found" error).
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(pw),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

/// Store a credential in the OS keyring.
pub fn set_credential(key: &str, value: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    entry.set_password(value).map_err(|e| e.to_string())?;
    Ok(())
}

/// Delete a credential from the OS keyring. Silently succeeds if the entry
/// does not exist.
pub fn delete_credential(key: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    match entry.delete_credential() {
        Ok(()) => Ok(()),
        Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// High-level API
// ---------------------------------------------------------------------------

/// The client is configured once it knows where the backend lives.
pub fn is_configured() -> bool {
    get_credential(KEY_API_URL)
        .map(|u| !u.trim().is_empty())
        .unwrap_or(false)
}

/// Persist the token and user record of a fresh login.
pub fn store_session(session: &Session) -> Result<(), String> {
    let user = serde_json::to_string(&session.user).map_err(|e| e.to_string())?;
    set_credential(KEY_AUTH_TOKEN, session.token())?;
    set_credential(KEY_SESSION_USER, &user)?;
    if let Some(branch_id) = &session.user.branch_id {
        set_credential(KEY_BRANCH_ID, branch_id)?;
    }
    info!(user_id = %session.user.id, "session stored in credential store");
    Ok(())
}

/// Restore the stored session, discarding it when unreadable or expired.
pub fn load_session() -> Option<Session> {
    let token = get_credential(KEY_AUTH_TOKEN)?;
    let user_raw = get_credential(KEY_SESSION_USER)?;
    let user: SessionUser = match serde_json::from_str(&user_raw) {
        Ok(u) => u,
        Err(e) => {
            warn!(error = %e, "stored session user unreadable, clearing session");
            if let Err(clear_err) = clear_session() {
                warn!(error = %clear_err, "failed to drop stale session");
            }
            return None;
        }
    };
    match Session::restore(&token, user) {
        Ok(session) => Some(session),
        Err(e) => {
            info!(reason = %e, "stored session no longer valid");
            if let Err(clear_err) = clear_session() {
                warn!(error = %clear_err, "failed to drop stale session");
            }
            None
        }
    }
}

/// Forget the login session, keeping the backend URL.
pub fn clear_session() -> Result<(), String> {
    for key in SESSION_KEYS {
        delete_credential(key)?;
    }
    Ok(())
}

/// Delete every stored credential (factory reset).
pub fn factory_reset() -> Result<(), String> {
    info!(keys = ALL_KEYS.len(), "forgetting every stored credential");
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    Ok(())
}
