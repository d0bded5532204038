//! Database groups and automatic dashboards.
//!
//! Input arrives already parsed from the IPC layer; this module validates it
//! against the store and writes each request in one transaction.

use rusqlite::{Connection, OptionalExtension};

#[derive(Debug, thiserror::Error)]
pub enum DashboardError {
    #[error("{0}")]
    Invalid(String),
    #[error("{what} {id} does not exist")]
    Missing { what: &'static str, id: i64 },
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
}

impl DashboardError {
    pub fn code(&self) -> &'static str {
        match self {
            DashboardError::Invalid(_) => "bad_params",
            DashboardError::Missing { .. } => "not_found",
            DashboardError::Conflict(_) => "conflict",
            DashboardError::Db(_) => "db_update_failed",
        }
    }
}

fn now_ts() -> String {
    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

fn exists(conn: &Connection, table: &str, id: i64) -> rusqlite::Result<bool> {
    let sql = format!("SELECT 1 FROM {table} WHERE id = ?");
    Ok(conn
        .query_row(&sql, [id], |r| r.get::<_, i64>(0))
        .optional()?
        .is_some())
}

#[derive(Debug, Clone)]
pub struct NewDatabaseGroup {
    pub name: String,
    pub database_ids: Vec<i64>,
}

pub fn create_database_group(
    conn: &Connection,
    input: &NewDatabaseGroup,
) -> Result<i64, DashboardError> {
    let name = input.name.trim();
    if name.is_empty() {
        return Err(DashboardError::Invalid("name must not be empty".into()));
    }
    let mut database_ids = input.database_ids.clone();
    database_ids.sort_unstable();
    database_ids.dedup();
    if database_ids.is_empty() {
        return Err(DashboardError::Invalid(
            "a group needs at least one database".into(),
        ));
    }

    let tx = conn.unchecked_transaction()?;
    let taken: Option<i64> = tx
        .query_row(
            "SELECT id FROM database_groups WHERE name = ?",
            [name],
            |r| r.get(0),
        )
        .optional()?;
    if taken.is_some() {
        return Err(DashboardError::Conflict(format!(
            "database group '{name}' already exists"
        )));
    }
    for id in &database_ids {
        if !exists(&tx, "dbs", *id)? {
            return Err(DashboardError::Missing {
                what: "database",
                id: *id,
            });
        }
    }

    let now = now_ts();
    tx.execute(
        "INSERT INTO database_groups(created_on, changed_on, name) VALUES(?, ?, ?)",
        (&now, &now, name),
    )?;
    let group_id = tx.last_insert_rowid();
    for id in &database_ids {
        tx.execute(
            "INSERT INTO databases_groups(database_group_id, database_id) VALUES(?, ?)",
            (group_id, id),
        )?;
    }
    tx.commit()?;
    tracing::info!(group_id, name, databases = database_ids.len(), "database group created");
    Ok(group_id)
}

#[derive(Debug, Clone)]
pub struct NewAutomaticDashboard {
    pub title: String,
    pub group_id: Option<i64>,
    pub slug: Option<String>,
    pub owner_ids: Vec<i64>,
    pub published: bool,
}

pub fn create_automatic_dashboard(
    conn: &Connection,
    input: &NewAutomaticDashboard,
) -> Result<i64, DashboardError> {
    let title = input.title.trim();
    if title.is_empty() {
        return Err(DashboardError::Invalid("title is required".into()));
    }
    let Some(group_id) = input.group_id else {
        return Err(DashboardError::Invalid("please choose one group".into()));
    };
    let slug = input
        .slug
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty());

    let tx = conn.unchecked_transaction()?;
    let bound: Option<Option<i64>> = tx
        .query_row(
            "SELECT dashboard_id FROM database_groups WHERE id = ?",
            [group_id],
            |r| r.get(0),
        )
        .optional()?;
    match bound {
        None => {
            return Err(DashboardError::Missing {
                what: "database group",
                id: group_id,
            })
        }
        Some(Some(existing)) => {
            return Err(DashboardError::Conflict(format!(
                "database group {group_id} is already used by dashboard {existing}"
            )))
        }
        Some(None) => {}
    }
    if let Some(slug) = slug {
        let taken: Option<i64> = tx
            .query_row("SELECT id FROM dashboards WHERE slug = ?", [slug], |r| {
                r.get(0)
            })
            .optional()?;
        if taken.is_some() {
            return Err(DashboardError::Conflict(format!(
                "slug '{slug}' is already in use"
            )));
        }
    }
    for owner in &input.owner_ids {
        if !exists(&tx, "ab_user", *owner)? {
            return Err(DashboardError::Missing {
                what: "user",
                id: *owner,
            });
        }
    }

    let now = now_ts();
    tx.execute(
        "INSERT INTO dashboards(created_on, changed_on, dashboard_title, slug, published)
         VALUES(?, ?, ?, ?, ?)",
        rusqlite::params![now, now, title, slug, input.published],
    )?;
    let dashboard_id = tx.last_insert_rowid();
    tx.execute(
        "INSERT INTO automatic_dashboards(id, created_on, changed_on) VALUES(?, ?, ?)",
        rusqlite::params![dashboard_id, now, now],
    )?;
    tx.execute(
        "UPDATE database_groups SET dashboard_id = ?, changed_on = ? WHERE id = ?",
        rusqlite::params![dashboard_id, now, group_id],
    )?;
    for owner in &input.owner_ids {
        tx.execute(
            "INSERT INTO dashboard_user(user_id, dashboard_id) VALUES(?, ?)",
            (owner, dashboard_id),
        )?;
    }
    tx.commit()?;
    tracing::info!(dashboard_id, group_id, "automatic dashboard created");
    Ok(dashboard_id)
}
