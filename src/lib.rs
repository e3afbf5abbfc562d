//! Counter POS - cashier, table and admin client for the POS REST backend.
//!
//! The backend owns every business rule. This crate mirrors its order
//! aggregate locally (the cart), derives totals when the server omits them,
//! and sequences the multi-step sale flow (create, confirm, pay, complete)
//! against the REST API. The `counter-pos` binary is a headless front end
//! over these modules.

pub mod admin;
pub mod api;
pub mod auth;
pub mod cart;
pub mod completion;
pub mod config;
pub mod db;
pub mod diagnostics;
pub mod flags;
pub mod models;
pub mod orders;
pub mod payments;
pub mod shifts;
pub mod storage;
pub mod tables;

use api::ApiClient;
use auth::{AuthError, AuthState, Session};
use config::AppConfig;
use db::DbState;

/// Everything an operation needs: local database, backend client, the
/// signed-in session and the resolved configuration.
pub struct AppContext {
    pub db: DbState,
    pub api: ApiClient,
    pub auth: AuthState,
    pub config: AppConfig,
}

impl AppContext {
    pub fn new(db: DbState, api: ApiClient, config: AppConfig) -> Self {
        Self {
            db,
            api,
            auth: AuthState::new(),
            config,
        }
    }

    /// The signed-in session, or an error when nobody is logged in.
    pub fn session(&self) -> Result<Session, AuthError> {
        self.auth.current()
    }
}
