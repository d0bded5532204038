use crate::dashboards::{
    create_automatic_dashboard, create_database_group, DashboardError, NewAutomaticDashboard,
    NewDatabaseGroup,
};
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::require_head;
use crate::ipc::types::{AppState, Request};
use serde_json::json;

fn dashboard_err(id: &str, e: &DashboardError) -> serde_json::Value {
    let details = match e {
        DashboardError::Missing { what, id: missing } => {
            Some(json!({ "what": what, "id": missing }))
        }
        _ => None,
    };
    err(id, e.code(), e.to_string(), details)
}

fn id_list(req: &Request, key: &str) -> Result<Vec<i64>, serde_json::Value> {
    match req.params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(Vec::new()),
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_i64().ok_or_else(|| {
                    err(
                        &req.id,
                        "bad_params",
                        format!("{key} must contain integer ids"),
                        None,
                    )
                })
            })
            .collect(),
        Some(_) => Err(err(
            &req.id,
            "bad_params",
            format!("{key} must be an array"),
            None,
        )),
    }
}

fn handle_database_group_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(name) = req.params.get("name").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing name", None);
    };
    let database_ids = match id_list(req, "databaseIds") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let conn = match require_head(state, &req.id) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let input = NewDatabaseGroup {
        name: name.to_string(),
        database_ids,
    };
    match create_database_group(conn, &input) {
        Ok(group_id) => ok(&req.id, json!({ "groupId": group_id })),
        Err(e) => dashboard_err(&req.id, &e),
    }
}

fn handle_create_automatic(state: &mut AppState, req: &Request) -> serde_json::Value {
    let title = req
        .params
        .get("title")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let group_id = match req.params.get("groupId") {
        None | Some(serde_json::Value::Null) => None,
        Some(v) => match v.as_i64() {
            Some(id) => Some(id),
            None => return err(&req.id, "bad_params", "groupId must be an integer", None),
        },
    };
    let slug = match req.params.get("slug") {
        None | Some(serde_json::Value::Null) => None,
        Some(v) => match v.as_str() {
            Some(s) => Some(s.to_string()),
            None => return err(&req.id, "bad_params", "slug must be a string", None),
        },
    };
    let owner_ids = match id_list(req, "ownerIds") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let published = req
        .params
        .get("published")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let conn = match require_head(state, &req.id) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let input = NewAutomaticDashboard {
        title,
        group_id,
        slug,
        owner_ids,
        published,
    };
    match create_automatic_dashboard(conn, &input) {
        Ok(dashboard_id) => ok(&req.id, json!({ "dashboardId": dashboard_id })),
        Err(e) => dashboard_err(&req.id, &e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "databaseGroups.create" => Some(handle_database_group_create(state, req)),
        "dashboards.createAutomatic" => Some(handle_create_automatic(state, req)),
        _ => None,
    }
}
