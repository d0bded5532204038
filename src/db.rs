use crate::objects::{DatabaseRecord, ObjectStore, TableRecord, UpsertOutcome};
use crate::schema::{ColumnSpec, ColumnType, DefaultValue, SchemaStore, StoreError, TableSpec};
use anyhow::Context;
use rusqlite::{Connection, OptionalExtension};
#[cfg(test)]
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

pub const VERSION_TABLE: &str = "schema_version";

pub fn open_db(workspace: &Path, db_file: &str) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)
        .with_context(|| format!("failed to create workspace {}", workspace.to_string_lossy()))?;
    let db_path = workspace.join(db_file);
    let conn = Connection::open(&db_path)
        .with_context(|| format!("failed to open database {}", db_path.to_string_lossy()))?;
    prepare_connection(&conn)?;
    Ok(conn)
}

/// Enable foreign keys and make sure the version marker table exists. Every
/// other table is owned by the migration chain.
pub fn prepare_connection(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS {VERSION_TABLE}(
                version_num VARCHAR(32) NOT NULL PRIMARY KEY
            )"
        ),
        [],
    )?;
    Ok(())
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn table_has_column(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let sql = format!("PRAGMA table_info({})", quote_ident(table));
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?",
            [table],
            |r| r.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn now_ts() -> String {
    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

fn column_sql(column: &ColumnSpec, default: Option<&DefaultValue>) -> String {
    let mut sql = format!("{} {}", quote_ident(&column.name), column.ty.sql());
    if !column.nullable {
        sql.push_str(" NOT NULL");
    }
    if let Some(d) = default {
        sql.push_str(" DEFAULT ");
        sql.push_str(&d.sql());
    }
    sql
}

fn ident_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn create_table_sql(spec: &TableSpec) -> String {
    let mut parts: Vec<String> = spec
        .columns
        .iter()
        .map(|c| column_sql(c, c.default.as_ref()))
        .collect();

    let pk: Vec<String> = spec
        .columns
        .iter()
        .filter(|c| c.primary_key)
        .map(|c| c.name.clone())
        .collect();
    if !pk.is_empty() {
        parts.push(format!("PRIMARY KEY ({})", ident_list(&pk)));
    }
    for unique in &spec.unique {
        parts.push(format!("UNIQUE ({})", ident_list(unique)));
    }
    for c in &spec.columns {
        if let Some(fk) = c.foreign_key.as_ref() {
            parts.push(format!(
                "FOREIGN KEY ({}) REFERENCES {} ({})",
                quote_ident(&c.name),
                quote_ident(&fk.table),
                quote_ident(&fk.column)
            ));
        }
    }

    format!(
        "CREATE TABLE {} (\n    {}\n)",
        quote_ident(&spec.name),
        parts.join(",\n    ")
    )
}

// SQLite refuses NOT NULL columns without a default even on empty tables, and
// rejects non-constant defaults in ADD COLUMN.
fn implicit_default(ty: ColumnType) -> DefaultValue {
    match ty {
        ColumnType::Integer => DefaultValue::Integer(0),
        ColumnType::String { .. } => DefaultValue::Text(String::new()),
        ColumnType::Boolean => DefaultValue::Boolean(false),
        ColumnType::Timestamp => DefaultValue::Text("1970-01-01 00:00:00".to_string()),
    }
}

pub struct SqliteStore<'c> {
    conn: &'c Connection,
}

impl<'c> SqliteStore<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    fn database_id(&self, name: &str) -> Result<Option<i64>, StoreError> {
        Ok(self
            .conn
            .query_row("SELECT id FROM dbs WHERE database_name = ?", [name], |r| {
                r.get(0)
            })
            .optional()?)
    }
}

impl SchemaStore for SqliteStore<'_> {
    fn has_table(&self, table: &str) -> Result<bool, StoreError> {
        Ok(table_exists(self.conn, table)?)
    }

    fn has_column(&self, table: &str, column: &str) -> Result<bool, StoreError> {
        Ok(table_has_column(self.conn, table, column)?)
    }

    fn row_count(&self, table: &str) -> Result<u64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
        let n: i64 = self.conn.query_row(&sql, [], |r| r.get(0))?;
        Ok(n.max(0) as u64)
    }

    fn create_table(&mut self, spec: &TableSpec) -> Result<(), StoreError> {
        self.conn.execute(&create_table_sql(spec), [])?;
        Ok(())
    }

    fn drop_table(&mut self, table: &str) -> Result<(), StoreError> {
        self.conn
            .execute(&format!("DROP TABLE {}", quote_ident(table)), [])?;
        Ok(())
    }

    fn add_column(&mut self, table: &str, column: &ColumnSpec) -> Result<(), StoreError> {
        if column.primary_key {
            return Err(StoreError::Invalid(format!(
                "cannot add primary key column '{}' to existing table '{}'",
                column.name, table
            )));
        }
        let implicit;
        let default = match column.default.as_ref() {
            Some(d) => Some(d),
            None if !column.nullable => {
                implicit = implicit_default(column.ty);
                Some(&implicit)
            }
            None => None,
        };
        let mut sql = format!(
            "ALTER TABLE {} ADD COLUMN {}",
            quote_ident(table),
            column_sql(column, default)
        );
        if let Some(fk) = column.foreign_key.as_ref() {
            sql.push_str(&format!(
                " REFERENCES {} ({})",
                quote_ident(&fk.table),
                quote_ident(&fk.column)
            ));
        }
        self.conn.execute(&sql, [])?;
        Ok(())
    }

    fn drop_column(&mut self, table: &str, column: &str) -> Result<(), StoreError> {
        self.conn.execute(
            &format!(
                "ALTER TABLE {} DROP COLUMN {}",
                quote_ident(table),
                quote_ident(column)
            ),
            [],
        )?;
        Ok(())
    }

    fn current_version(&self) -> Result<Option<String>, StoreError> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT version_num FROM {VERSION_TABLE} LIMIT 1"),
                [],
                |r| r.get(0),
            )
            .optional()?)
    }

    fn set_version(&mut self, version: Option<&str>) -> Result<(), StoreError> {
        self.conn
            .execute(&format!("DELETE FROM {VERSION_TABLE}"), [])?;
        if let Some(v) = version {
            self.conn
                .execute(
                    &format!("INSERT INTO {VERSION_TABLE}(version_num) VALUES(?)"),
                    [v],
                )?;
        }
        Ok(())
    }

    fn begin_step(&mut self) -> Result<(), StoreError> {
        self.conn.execute_batch("SAVEPOINT migration_step")?;
        Ok(())
    }

    fn commit_step(&mut self) -> Result<(), StoreError> {
        self.conn.execute_batch("RELEASE migration_step")?;
        Ok(())
    }

    fn rollback_step(&mut self) -> Result<(), StoreError> {
        self.conn
            .execute_batch("ROLLBACK TO migration_step; RELEASE migration_step")?;
        Ok(())
    }
}

impl ObjectStore for SqliteStore<'_> {
    fn upsert_database(&mut self, record: &DatabaseRecord) -> Result<UpsertOutcome, StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        let now = now_ts();
        let existing = self.database_id(&record.database_name)?;
        let outcome = match existing {
            Some(id) => {
                tx.execute(
                    "UPDATE dbs SET
                       sqlalchemy_uri = ?,
                       expose_in_sqllab = ?,
                       allow_run_async = ?,
                       allow_dml = ?,
                       cache_timeout = ?,
                       extra = ?,
                       changed_on = ?
                     WHERE id = ?",
                    rusqlite::params![
                        record.sqlalchemy_uri,
                        record.expose_in_sqllab,
                        record.allow_run_async,
                        record.allow_dml,
                        record.cache_timeout,
                        record.extra,
                        now,
                        id
                    ],
                )?;
                UpsertOutcome::Updated
            }
            None => {
                tx.execute(
                    "INSERT INTO dbs(
                       created_on, changed_on, database_name, sqlalchemy_uri,
                       expose_in_sqllab, allow_run_async, allow_dml, cache_timeout, extra
                     ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    rusqlite::params![
                        now,
                        now,
                        record.database_name,
                        record.sqlalchemy_uri,
                        record.expose_in_sqllab,
                        record.allow_run_async,
                        record.allow_dml,
                        record.cache_timeout,
                        record.extra
                    ],
                )?;
                UpsertOutcome::Inserted
            }
        };
        tx.commit()?;
        Ok(outcome)
    }

    fn upsert_table(&mut self, record: &TableRecord) -> Result<UpsertOutcome, StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        let Some(database_id) = self.database_id(&record.database_name)? else {
            return Err(StoreError::NotFound {
                what: "database",
                key: record.database_name.clone(),
            });
        };
        let now = now_ts();
        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM tables WHERE database_id = ? AND table_name = ?",
                rusqlite::params![database_id, record.table_name],
                |r| r.get(0),
            )
            .optional()?;
        let outcome = match existing {
            Some(id) => {
                tx.execute(
                    "UPDATE tables SET schema = ?, description = ?, sql = ?, changed_on = ?
                     WHERE id = ?",
                    rusqlite::params![record.schema, record.description, record.sql, now, id],
                )?;
                UpsertOutcome::Updated
            }
            None => {
                tx.execute(
                    "INSERT INTO tables(
                       created_on, changed_on, table_name, database_id, schema, description, sql
                     ) VALUES(?, ?, ?, ?, ?, ?, ?)",
                    rusqlite::params![
                        now,
                        now,
                        record.table_name,
                        database_id,
                        record.schema,
                        record.description,
                        record.sql
                    ],
                )?;
                UpsertOutcome::Inserted
            }
        };
        tx.commit()?;
        Ok(outcome)
    }

    fn list_databases(&self) -> Result<Vec<DatabaseRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT database_name, sqlalchemy_uri, expose_in_sqllab, allow_run_async,
                    allow_dml, cache_timeout, extra
             FROM dbs
             ORDER BY database_name",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(DatabaseRecord {
                    database_name: row.get(0)?,
                    sqlalchemy_uri: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    expose_in_sqllab: row.get::<_, Option<bool>>(2)?.unwrap_or(true),
                    allow_run_async: row.get::<_, Option<bool>>(3)?.unwrap_or(false),
                    allow_dml: row.get::<_, Option<bool>>(4)?.unwrap_or(false),
                    cache_timeout: row.get(5)?,
                    extra: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn list_tables(&self) -> Result<Vec<TableRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT t.table_name, d.database_name, t.schema, t.description, t.sql
             FROM tables t
             JOIN dbs d ON d.id = t.database_id
             ORDER BY d.database_name, t.table_name",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(TableRecord {
                    table_name: row.get(0)?,
                    database_name: row.get(1)?,
                    schema: row.get(2)?,
                    description: row.get(3)?,
                    sql: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnShape {
    pub decl_type: String,
    pub not_null: bool,
    pub primary_key: bool,
}

#[cfg(test)]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableShape {
    pub columns: BTreeMap<String, ColumnShape>,
    /// (from column, target table, target column)
    pub foreign_keys: BTreeSet<(String, String, String)>,
}

/// Structural description of every user table, used to compare a store
/// before and after a migration round trip. Column order and defaults are
/// left out.
#[cfg(test)]
pub fn schema_snapshot(conn: &Connection) -> rusqlite::Result<BTreeMap<String, TableShape>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name <> ?
         ORDER BY name",
    )?;
    let tables = stmt
        .query_map([VERSION_TABLE], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut out = BTreeMap::new();
    for table in tables {
        let mut shape = TableShape::default();

        let mut info = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(&table)))?;
        let mut rows = info.query([])?;
        while let Some(row) = rows.next()? {
            let name: String = row.get(1)?;
            let decl_type: String = row.get(2)?;
            let not_null: i64 = row.get(3)?;
            let pk: i64 = row.get(5)?;
            shape.columns.insert(
                name,
                ColumnShape {
                    decl_type: decl_type.to_ascii_uppercase(),
                    not_null: not_null != 0,
                    primary_key: pk != 0,
                },
            );
        }

        let mut fks = conn.prepare(&format!(
            "PRAGMA foreign_key_list({})",
            quote_ident(&table)
        ))?;
        let mut rows = fks.query([])?;
        while let Some(row) = rows.next()? {
            let target: String = row.get(2)?;
            let from: String = row.get(3)?;
            let to: Option<String> = row.get(4)?;
            shape
                .foreign_keys
                .insert((from, target, to.unwrap_or_default()));
        }

        out.insert(table, shape);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_store() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        prepare_connection(&conn).expect("prepare connection");
        conn
    }

    #[test]
    fn create_table_sql_lists_constraints_after_columns() {
        let spec = TableSpec::new(
            "database_groups",
            vec![
                ColumnSpec::integer("id").primary_key(),
                ColumnSpec::string("name", 250),
                ColumnSpec::integer("dashboard_id").references("automatic_dashboards", "id"),
            ],
        )
        .unique(&["name"]);
        let sql = create_table_sql(&spec);
        assert!(sql.starts_with("CREATE TABLE \"database_groups\""));
        assert!(sql.contains("\"id\" INTEGER NOT NULL"));
        assert!(sql.contains("\"name\" VARCHAR(250)"));
        assert!(sql.contains("PRIMARY KEY (\"id\")"));
        assert!(sql.contains("UNIQUE (\"name\")"));
        assert!(sql.contains(
            "FOREIGN KEY (\"dashboard_id\") REFERENCES \"automatic_dashboards\" (\"id\")"
        ));
    }

    #[test]
    fn version_marker_set_and_clear() {
        let conn = memory_store();
        let mut store = SqliteStore::new(&conn);
        assert_eq!(store.current_version().expect("read"), None);
        store.set_version(Some("abc")).expect("set");
        assert_eq!(store.current_version().expect("read").as_deref(), Some("abc"));
        store.set_version(Some("def")).expect("set");
        assert_eq!(store.current_version().expect("read").as_deref(), Some("def"));
        store.set_version(None).expect("clear");
        assert_eq!(store.current_version().expect("read"), None);
    }

    #[test]
    fn not_null_column_added_to_empty_table_gets_implicit_default() {
        let conn = memory_store();
        let mut store = SqliteStore::new(&conn);
        store
            .create_table(&TableSpec::new(
                "slices",
                vec![ColumnSpec::integer("id").primary_key()],
            ))
            .expect("create");
        store
            .add_column("slices", &ColumnSpec::boolean("published").not_null())
            .expect("add not-null column");
        let snap = schema_snapshot(&conn).expect("snapshot");
        let col = &snap["slices"].columns["published"];
        assert!(col.not_null);
        assert_eq!(col.decl_type, "BOOLEAN");
    }

    #[test]
    fn snapshot_excludes_version_table() {
        let conn = memory_store();
        let snap = schema_snapshot(&conn).expect("snapshot");
        assert!(snap.is_empty());
    }
}
