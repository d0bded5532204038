use crate::db::SqliteStore;
use crate::ipc::error::{err, no_workspace, ok};
use crate::ipc::types::{AppState, Request};
use crate::migrate::{MigrateError, Migrator, HEAD};
use serde_json::json;

/// Map a migration failure onto the IPC error envelope.
pub fn migrate_err(id: &str, e: &MigrateError) -> serde_json::Value {
    match e {
        MigrateError::UnknownStep(step) => {
            err(id, "unknown_step", e.to_string(), Some(json!({ "step": step })))
        }
        MigrateError::DivergentHistory { current, target } => err(
            id,
            "divergent_history",
            e.to_string(),
            Some(json!({ "current": current, "target": target })),
        ),
        MigrateError::MigrationFailed {
            step,
            direction,
            cause,
        } => err(
            id,
            "migration_failed",
            e.to_string(),
            Some(json!({
                "step": step,
                "direction": direction,
                "cause": cause.to_string(),
            })),
        ),
        MigrateError::Chain(_) => err(id, "invalid_chain", e.to_string(), None),
        MigrateError::Store(_) => err(id, "db_query_failed", e.to_string(), None),
    }
}

fn target_param<'a>(
    req: &'a Request,
    default: Option<&'a str>,
) -> Result<&'a str, serde_json::Value> {
    match req.params.get("target") {
        None | Some(serde_json::Value::Null) => match default {
            Some(d) => Ok(d),
            None => Err(err(&req.id, "bad_params", "missing target", None)),
        },
        Some(v) => match v.as_str().map(str::trim) {
            Some(t) if !t.is_empty() => Ok(t),
            _ => Err(err(
                &req.id,
                "bad_params",
                "target must be a non-empty string",
                None,
            )),
        },
    }
}

fn handle_status(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(&req.id);
    };
    let store = SqliteStore::new(conn);
    match Migrator::new(&state.chain).status(&store) {
        Ok(status) => match serde_json::to_value(status) {
            Ok(v) => ok(&req.id, v),
            Err(e) => err(&req.id, "internal", e.to_string(), None),
        },
        Err(e) => migrate_err(&req.id, &e),
    }
}

fn handle_history(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(&req.id);
    };
    let store = SqliteStore::new(conn);
    let status = match Migrator::new(&state.chain).status(&store) {
        Ok(s) => s,
        Err(e) => return migrate_err(&req.id, &e),
    };

    let steps: Vec<serde_json::Value> = state
        .chain
        .iter()
        .map(|step| {
            json!({
                "id": step.id,
                "predecessor": step.predecessor,
                "description": step.description,
                "applied": status.applied.contains(&step.id),
            })
        })
        .collect();
    ok(
        &req.id,
        json!({
            "current": status.current,
            "head": status.head,
            "steps": steps,
        }),
    )
}

fn handle_upgrade(state: &mut AppState, req: &Request) -> serde_json::Value {
    let target = match target_param(req, Some(HEAD)) {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(&req.id);
    };
    let mut store = SqliteStore::new(conn);
    match Migrator::new(&state.chain).upgrade_to(&mut store, target) {
        Ok(report) => match serde_json::to_value(report) {
            Ok(v) => ok(&req.id, v),
            Err(e) => err(&req.id, "internal", e.to_string(), None),
        },
        Err(e) => migrate_err(&req.id, &e),
    }
}

fn handle_downgrade(state: &mut AppState, req: &Request) -> serde_json::Value {
    let target = match target_param(req, None) {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    let Some(conn) = state.db.as_ref() else {
        return no_workspace(&req.id);
    };
    let mut store = SqliteStore::new(conn);
    match Migrator::new(&state.chain).downgrade_to(&mut store, target) {
        Ok(report) => match serde_json::to_value(report) {
            Ok(v) => ok(&req.id, v),
            Err(e) => err(&req.id, "internal", e.to_string(), None),
        },
        Err(e) => migrate_err(&req.id, &e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "schema.status" => Some(handle_status(state, req)),
        "schema.history" => Some(handle_history(state, req)),
        "schema.upgrade" => Some(handle_upgrade(state, req)),
        "schema.downgrade" => Some(handle_downgrade(state, req)),
        _ => None,
    }
}
