//! Login against the POS backend and role-based session handling.
//!
//! The backend issues a bearer token (a JWT) together with the user record.
//! The role decides which view the user lands on and which operations the
//! client lets them start. Sessions are kept in memory; the token itself is
//! persisted in the OS credential store by [`crate::storage`].

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{info, warn};
use zeroize::Zeroize;

use crate::api::{ApiClient, ApiError};
use crate::db::DbState;
use crate::flags;

/// Permissions granted to administrators.
const ADMIN_PERMISSIONS: &[&str] = &[
    "view_dashboard",
    "manage_catalog",
    "manage_customers",
    "manage_taxes",
    "manage_staff",
    "manage_reservations",
    "manage_business",
    "view_orders",
    "create_order",
    "take_payment",
    "refund_payment",
    "manage_tables",
    "manage_shift",
];

/// Permissions granted to branch managers.
const BRANCH_MANAGER_PERMISSIONS: &[&str] = &[
    "view_dashboard",
    "manage_customers",
    "manage_reservations",
    "view_orders",
    "create_order",
    "take_payment",
    "refund_payment",
    "manage_tables",
    "manage_shift",
];

const CASHIER_PERMISSIONS: &[&str] = &[
    "view_orders",
    "create_order",
    "take_payment",
    "manage_tables",
    "manage_shift",
    "manage_customers",
];

const WAITER_PERMISSIONS: &[&str] = &["view_orders", "create_order", "manage_tables"];

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Email and password are required")]
    MissingCredentials,
    #[error("Unexpected login response: {0}")]
    InvalidResponse(String),
    #[error("Unsupported role: {0}")]
    UnknownRole(String),
    #[error("Session expired, please log in again")]
    Expired,
    #[error("Not logged in")]
    NotLoggedIn,
    #[error("Permission denied: {0}")]
    Forbidden(String),
    #[error("Session storage: {0}")]
    Storage(String),
    #[error(transparent)]
    Api(#[from] ApiError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Admin,
    BranchManager,
    Cashier,
    Waiter,
}

impl Role {
    pub fn permissions(self) -> &'static [&'static str] {
        match self {
            Role::Admin => ADMIN_PERMISSIONS,
            Role::BranchManager => BRANCH_MANAGER_PERMISSIONS,
            Role::Cashier => CASHIER_PERMISSIONS,
            Role::Waiter => WAITER_PERMISSIONS,
        }
    }

    /// View a user of this role starts on after login.
    pub fn landing_view(self) -> &'static str {
        match self {
            Role::Admin => "admin/dashboard",
            Role::BranchManager => "branch/overview",
            Role::Cashier => "cashier/sales",
            Role::Waiter => "waiter/tables",
        }
    }
}

impl FromStr for Role {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace(['-', ' '], "_").as_str() {
            "ADMIN" | "SUPER_ADMIN" | "OWNER" => Ok(Role::Admin),
            "BRANCH_MANAGER" | "MANAGER" => Ok(Role::BranchManager),
            "CASHIER" => Ok(Role::Cashier),
            "WAITER" | "SERVER" => Ok(Role::Waiter),
            _ => Err(AuthError::UnknownRole(s.to_string())),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Admin => "ADMIN",
            Role::BranchManager => "BRANCH_MANAGER",
            Role::Cashier => "CASHIER",
            Role::Waiter => "WAITER",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUser {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    pub role: Role,
    #[serde(default)]
    pub branch_id: Option<String>,
}

/// An authenticated session.
#[derive(Clone)]
pub struct Session {
    token: String,
    pub user: SessionUser,
    pub login_time: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("user", &self.user)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.token.zeroize();
    }
}

impl Session {
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.map(|exp| Utc::now() >= exp).unwrap_or(false)
    }

    pub fn can(&self, permission: &str) -> bool {
        self.user.role.permissions().contains(&permission)
    }

    /// Fail with [`AuthError::Forbidden`] unless the role grants `permission`.
    pub fn require(&self, permission: &str) -> Result<(), AuthError> {
        if self.is_expired() {
            return Err(AuthError::Expired);
        }
        if self.can(permission) {
            Ok(())
        } else {
            Err(AuthError::Forbidden(permission.to_string()))
        }
    }

    pub fn landing_view(&self) -> &'static str {
        self.user.role.landing_view()
    }

    /// Public view of the session (no token).
    pub fn to_user_json(&self) -> Value {
        json!({
            "user": self.user,
            "permissions": self.user.role.permissions(),
            "landingView": self.landing_view(),
            "loginTime": self.login_time.to_rfc3339(),
            "expiresAt": self.expires_at.map(|e| e.to_rfc3339()),
        })
    }

    /// Rebuild a session from a stored token and user record.
    pub fn restore(token: &str, user: SessionUser) -> Result<Session, AuthError> {
        let expires_at = decode_token_claims(token).as_ref().and_then(claims_expiry);
        let session = Session {
            token: token.to_string(),
            user,
            login_time: Utc::now(),
            expires_at,
        };
        if session.is_expired() {
            return Err(AuthError::Expired);
        }
        Ok(session)
    }
}

// ---------------------------------------------------------------------------
// Token helpers
// ---------------------------------------------------------------------------

/// Decode the (unverified) claims segment of a JWT.
pub fn decode_token_claims(token: &str) -> Option<Value> {
    let payload = token.split('.').nth(1)?;
    let trimmed = payload.trim_end_matches('=');
    let bytes = URL_SAFE_NO_PAD.decode(trimmed).ok()?;
    serde_json::from_slice::<Value>(&bytes).ok()
}

fn claims_expiry(claims: &Value) -> Option<DateTime<Utc>> {
    let exp = claims.get("exp")?.as_i64()?;
    Utc.timestamp_opt(exp, 0).single()
}

fn str_of(v: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match v.get(*k) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// Build a session from a login response.
pub fn session_from_login_response(body: &Value) -> Result<Session, AuthError> {
    let token = str_of(body, &["token", "accessToken", "access_token"])
        .ok_or_else(|| AuthError::InvalidResponse("missing token".into()))?;
    let claims = decode_token_claims(&token).unwrap_or(Value::Null);
    let user_value = body.get("user").cloned().unwrap_or(Value::Null);

    let id = str_of(&user_value, &["id", "_id", "userId"])
        .or_else(|| str_of(&claims, &["sub", "userId", "id"]))
        .ok_or_else(|| AuthError::InvalidResponse("missing user id".into()))?;
    let role_raw = str_of(&user_value, &["role"])
        .or_else(|| {
            user_value
                .get("role")
                .and_then(|r| str_of(r, &["name", "code"]))
        })
        .or_else(|| str_of(&claims, &["role"]))
        .ok_or_else(|| AuthError::InvalidResponse("missing role".into()))?;
    let role = Role::from_str(&role_raw)?;

    let name = str_of(&user_value, &["name", "fullName"]).or_else(|| {
        let first = str_of(&user_value, &["firstName", "first_name"]);
        let last = str_of(&user_value, &["lastName", "last_name"]);
        match (first, last) {
            (Some(f), Some(l)) => Some(format!("{f} {l}")),
            (f, l) => f.or(l),
        }
    });

    let now = Utc::now();
    let expires_at = claims_expiry(&claims).or_else(|| {
        body.get("expiresIn")
            .and_then(Value::as_i64)
            .map(|secs| now + Duration::seconds(secs))
    });

    Ok(Session {
        token,
        user: SessionUser {
            id,
            name,
            email: str_of(&user_value, &["email"]),
            role,
            branch_id: str_of(&user_value, &["branchId", "branch_id"])
                .or_else(|| str_of(&claims, &["branchId"])),
        },
        login_time: now,
        expires_at,
    })
}

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// Shared state holding the current session.
#[derive(Default)]
pub struct AuthState {
    session: Mutex<Option<Session>>,
}

impl AuthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, session: Session) {
        if let Ok(mut current) = self.session.lock() {
            *current = Some(session);
        }
    }

    /// Current session, dropping it when expired.
    pub fn current(&self) -> Result<Session, AuthError> {
        let mut guard = self
            .session
            .lock()
            .map_err(|e| AuthError::Storage(e.to_string()))?;
        match guard.as_ref() {
            Some(s) if s.is_expired() => {
                *guard = None;
                Err(AuthError::Expired)
            }
            Some(s) => Ok(s.clone()),
            None => Err(AuthError::NotLoggedIn),
        }
    }

    pub fn clear(&self) -> Option<Session> {
        self.session.lock().ok().and_then(|mut s| s.take())
    }
}

/// Log in with email and password.
pub async fn login(api: &ApiClient, email: &str, password: &str) -> Result<Session, AuthError> {
    if email.trim().is_empty() || password.is_empty() {
        return Err(AuthError::MissingCredentials);
    }
    let body = api
        .post(
            "/auth/login",
            json!({ "email": email.trim(), "password": password }),
        )
        .await?;
    let session = session_from_login_response(&body)?;
    info!(user_id = %session.user.id, role = %session.user.role, "login successful");
    Ok(session)
}

/// Start a fresh session: remember it and drop flags from the previous one.
pub fn begin_session(auth: &AuthState, db: &DbState, session: Session) -> Result<(), AuthError> {
    flags::clear_all(db).map_err(AuthError::Storage)?;
    auth.set(session);
    Ok(())
}

/// End the current session and drop its refresh flags.
pub fn logout(auth: &AuthState, db: &DbState) -> Result<(), AuthError> {
    if let Some(session) = auth.clear() {
        info!(user_id = %session.user.id, "session logged out");
    } else {
        warn!("logout without an active session");
    }
    flags::clear_all(db).map_err(AuthError::Storage)
}
