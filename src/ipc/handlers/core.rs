use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::schema::migrate_err;
use crate::ipc::types::{AppState, Request};
use crate::migrate::{Migrator, BASE, HEAD};
use crate::schema::SchemaStore;
use serde_json::json;
use std::path::PathBuf;

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
            "schemaHead": state.chain.head(),
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    select_workspace(state, &req.id, path)
}

/// Open the workspace database, upgrading it to head first when the daemon
/// runs with `auto_upgrade`.
pub fn select_workspace(state: &mut AppState, id: &str, path: PathBuf) -> serde_json::Value {
    let conn = match db::open_db(&path, &state.config.db_file) {
        Ok(conn) => conn,
        Err(e) => return err(id, "db_open_failed", format!("{e:?}"), None),
    };

    let mut store = db::SqliteStore::new(&conn);
    if state.config.auto_upgrade {
        if let Err(e) = Migrator::new(&state.chain).upgrade_to(&mut store, HEAD) {
            return migrate_err(id, &e);
        }
    }
    let version = match store.current_version() {
        Ok(v) => v,
        Err(e) => return err(id, "db_query_failed", e.to_string(), None),
    };

    tracing::info!(
        workspace = %path.to_string_lossy(),
        schema_version = version.as_deref().unwrap_or(BASE),
        "workspace selected"
    );
    let result = json!({
        "workspacePath": path.to_string_lossy(),
        "schemaVersion": version,
    });
    state.workspace = Some(path);
    state.db = Some(conn);
    ok(id, result)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        _ => None,
    }
}
