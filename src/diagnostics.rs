//! Diagnostics module for Counter POS.
//!
//! Provides:
//! - **Logging setup**: console plus daily rolling file, filtered by `RUST_LOG`
//! - **Log rotation helpers**: keep the newest `MAX_LOG_FILES` files
//! - **About info**: version, build timestamp, git SHA, platform
//! - **System health**: backend reachability and the local state of the client

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::api::ApiClient;
use crate::cart;
use crate::db::DbState;
use crate::flags;
use crate::shifts;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

/// File name prefix of the rolling log files.
const LOG_FILE_PREFIX: &str = "pos";

const DEFAULT_FILTER: &str = "info,counter_pos=debug";

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Log directory under the data directory.
pub fn get_log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

/// Install the global subscriber: stderr console layer plus a daily rolling
/// file in `log_dir`. The returned guard flushes the file writer on drop and
/// must be held until exit.
pub fn init_logging(log_dir: &Path, verbose: bool, json_file: bool) -> Result<WorkerGuard, String> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "debug" } else { DEFAULT_FILTER })
    });

    fs::create_dir_all(log_dir).map_err(|e| format!("create log dir: {e}"))?;
    prune_old_logs(log_dir);

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let text_file_layer = (!json_file).then(|| {
        fmt::layer()
            .with_writer(non_blocking.clone())
            .with_ansi(false)
            .with_target(true)
    });
    let json_file_layer = json_file.then(|| {
        fmt::layer()
            .json()
            .with_writer(non_blocking)
            .with_target(true)
    });
    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(verbose);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(text_file_layer)
        .with(json_file_layer)
        .try_init()
        .map_err(|e| format!("install subscriber: {e}"))?;

    Ok(guard)
}

/// Prune old log files, keeping only the most recent `MAX_LOG_FILES`.
pub fn prune_old_logs(log_dir: &Path) {
    if !log_dir.exists() {
        return;
    }

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let is_log = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|name| name.starts_with(&format!("{LOG_FILE_PREFIX}.")))
                .unwrap_or(false);
            if is_log {
                let modified = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(std::time::UNIX_EPOCH);
                log_files.push((path, modified));
            }
        }
    }

    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    for (path, _) in log_files.iter().skip(MAX_LOG_FILES) {
        if let Err(e) = fs::remove_file(path) {
            warn!("Failed to prune log file {}: {e}", path.display());
        }
    }
}

// ---------------------------------------------------------------------------
// About info
// ---------------------------------------------------------------------------

/// Returns version, build timestamp, git SHA, and platform info.
pub fn about_info() -> Value {
    json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "buildTimestamp": env!("BUILD_TIMESTAMP"),
        "gitSha": env!("BUILD_GIT_SHA"),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "rustVersion": env!("CARGO_PKG_RUST_VERSION"),
    })
}

// ---------------------------------------------------------------------------
// System health
// ---------------------------------------------------------------------------

/// Local database facts, collected under one lock.
fn local_state(db: &DbState) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let schema_version: i32 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| {
            row.get(0)
        })
        .unwrap_or(0);
    let raised: Vec<String> = conn
        .prepare("SELECT flag FROM session_flags ORDER BY raised_at")
        .and_then(|mut stmt| {
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>();
            rows
        })
        .unwrap_or_default();
    let db_size = fs::metadata(&db.db_path).map(|m| m.len()).unwrap_or(0);
    Ok(json!({
        "schemaVersion": schema_version,
        "raisedFlags": raised,
        "dbSizeBytes": db_size,
    }))
}

/// Health report for the `health` command.
pub async fn system_health(db: &DbState, api: Option<&ApiClient>) -> Result<Value, String> {
    let mut report = local_state(db)?;

    report["activeShiftId"] = json!(shifts::active_shift_id(db));
    report["cartSnapshot"] = json!(cart::load_snapshot(db, cart::ACTIVE_SLOT)
        .ok()
        .flatten()
        .map(|c| json!({ "orderId": c.order_id, "lines": c.lines.len() })));
    report["tablesDirty"] = json!(flags::peek(db, flags::TABLES_DIRTY)?.is_some());

    report["backend"] = match api {
        Some(api) => json!({
            "url": api.base_url(),
            "connectivity": api.check_connectivity().await,
        }),
        None => json!({ "url": null, "connectivity": null }),
    };
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::DEFAULT_TIMEOUT;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_about_info_has_required_fields() {
        let info = about_info();
        assert_eq!(info["name"], json!("counter-pos"));
        assert!(info.get("version").is_some());
        assert!(info.get("buildTimestamp").is_some());
        assert!(info.get("gitSha").is_some());
        assert!(info.get("platform").is_some());
    }

    #[test]
    fn test_prune_keeps_newest_log_files() {
        let dir = tempfile::tempdir().unwrap();
        for day in 1..=12 {
            let path = dir.path().join(format!("pos.2026-01-{day:02}"));
            fs::write(&path, "line\n").unwrap();
            let mtime = std::time::UNIX_EPOCH + std::time::Duration::from_secs(day * 86_400);
            fs::File::options()
                .write(true)
                .open(&path)
                .unwrap()
                .set_modified(mtime)
                .unwrap();
        }
        fs::write(dir.path().join("other.txt"), "keep").unwrap();

        prune_old_logs(dir.path());

        let remaining: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(remaining.len(), MAX_LOG_FILES + 1);
        assert!(remaining.contains(&"other.txt".to_string()));
        assert!(!remaining.contains(&"pos.2026-01-01".to_string()));
        assert!(!remaining.contains(&"pos.2026-01-02".to_string()));
    }

    #[tokio::test]
    async fn test_system_health_reports_local_and_backend_state() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let db = crate::db::init(dir.path()).unwrap();
        flags::raise(&db, flags::TABLES_DIRTY, None).unwrap();
        let api = ApiClient::new(&server.uri(), DEFAULT_TIMEOUT).unwrap();

        let health = system_health(&db, Some(&api)).await.unwrap();
        assert_eq!(health["schemaVersion"], json!(2));
        assert_eq!(health["tablesDirty"], json!(true));
        assert_eq!(health["raisedFlags"], json!(["tables_dirty"]));
        assert_eq!(health["backend"]["connectivity"]["success"], json!(true));
        assert!(health["cartSnapshot"].is_null());
    }
}
