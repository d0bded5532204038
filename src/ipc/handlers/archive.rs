use crate::archive;
use crate::db::SqliteStore;
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::require_head;
use crate::ipc::types::{AppState, Request};
use crate::objects::ObjectStore;
use serde_json::json;
use std::fs::File;
use std::io::Cursor;
use std::path::PathBuf;

fn path_param(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    match req.params.get(key).and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(err(&req.id, "bad_params", format!("missing {key}"), None)),
    }
}

fn handle_archive_import(state: &mut AppState, req: &Request) -> serde_json::Value {
    let path = match path_param(req, "path") {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let conn = match require_head(state, &req.id) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let bytes = match std::fs::read(&path) {
        Ok(b) => b,
        Err(e) => {
            return err(
                &req.id,
                "io_failed",
                e.to_string(),
                Some(json!({ "path": path })),
            )
        }
    };

    tracing::info!(path = %path, bytes = bytes.len(), "importing archive");
    let mut store = SqliteStore::new(conn);
    let summary = match archive::import_archive(
        &mut store,
        Cursor::new(bytes),
        &state.config.import_config(),
    ) {
        Ok(s) => s,
        Err(e) => {
            return err(
                &req.id,
                "corrupt_archive",
                e.to_string(),
                Some(json!({ "path": path })),
            )
        }
    };

    match serde_json::to_value(summary) {
        Ok(v) => ok(&req.id, v),
        Err(e) => err(&req.id, "internal", e.to_string(), None),
    }
}

fn handle_archive_export(state: &mut AppState, req: &Request) -> serde_json::Value {
    let out_path = match path_param(req, "outPath") {
        Ok(p) => p,
        Err(resp) => return resp,
    };
    let conn = match require_head(state, &req.id) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let out = PathBuf::from(&out_path);
    if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Err(e) = std::fs::create_dir_all(parent) {
            return err(
                &req.id,
                "io_failed",
                e.to_string(),
                Some(json!({ "path": out_path })),
            );
        }
    }
    let file = match File::create(&out) {
        Ok(f) => f,
        Err(e) => {
            return err(
                &req.id,
                "io_failed",
                e.to_string(),
                Some(json!({ "path": out_path })),
            )
        }
    };

    let store = SqliteStore::new(conn);
    let export = match archive::export_archive(&store, file, Some(state.chain.head())) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "io_failed",
                format!("{e:#}"),
                Some(json!({ "path": out_path })),
            )
        }
    };

    ok(
        &req.id,
        json!({
            "path": out_path,
            "databases": export.databases,
            "tables": export.tables,
            "entryCount": export.entry_count,
        }),
    )
}

fn handle_databases_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match require_head(state, &req.id) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    match SqliteStore::new(conn).list_databases() {
        Ok(databases) => ok(&req.id, json!({ "databases": databases })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_tables_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match require_head(state, &req.id) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    match SqliteStore::new(conn).list_tables() {
        Ok(tables) => ok(&req.id, json!({ "tables": tables })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "archive.import" => Some(handle_archive_import(state, req)),
        "archive.export" => Some(handle_archive_export(state, req)),
        "databases.list" => Some(handle_databases_list(state, req)),
        "tables.list" => Some(handle_tables_list(state, req)),
        _ => None,
    }
}
