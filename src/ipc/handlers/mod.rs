pub mod archive;
pub mod core;
pub mod dashboards;
pub mod schema;

use crate::db::SqliteStore;
use crate::ipc::error::{err, no_workspace};
use crate::ipc::types::AppState;
use crate::migrate::BASE;
use crate::schema::SchemaStore;
use rusqlite::Connection;
use serde_json::json;

/// The open connection, provided the workspace schema sits at the chain head.
/// Object-level methods refuse to run against any other schema version.
pub(crate) fn require_head<'a>(
    state: &'a AppState,
    id: &str,
) -> Result<&'a Connection, serde_json::Value> {
    let Some(conn) = state.db.as_ref() else {
        return Err(no_workspace(id));
    };
    let current = SqliteStore::new(conn)
        .current_version()
        .map_err(|e| err(id, "db_query_failed", e.to_string(), None))?;
    let head = state.chain.head();
    if current.as_deref() != Some(head) {
        return Err(err(
            id,
            "schema_out_of_date",
            "upgrade the workspace schema first",
            Some(json!({
                "current": current.as_deref().unwrap_or(BASE),
                "required": head,
            })),
        ));
    }
    Ok(conn)
}
