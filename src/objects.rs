use crate::schema::StoreError;
use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

/// A database connection descriptor. `database_name` is the natural key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseRecord {
    pub database_name: String,
    pub sqlalchemy_uri: String,
    #[serde(default = "default_true")]
    pub expose_in_sqllab: bool,
    #[serde(default)]
    pub allow_run_async: bool,
    #[serde(default)]
    pub allow_dml: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_timeout: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<String>,
}

impl DatabaseRecord {
    pub fn validate(&self) -> Result<(), String> {
        if self.database_name.trim().is_empty() {
            return Err("database_name must not be empty".into());
        }
        if self.sqlalchemy_uri.trim().is_empty() {
            return Err("sqlalchemy_uri must not be empty".into());
        }
        if matches!(self.cache_timeout, Some(t) if t < 0) {
            return Err("cache_timeout must not be negative".into());
        }
        Ok(())
    }
}

/// A table descriptor. Keyed by (`database_name`, `table_name`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRecord {
    pub table_name: String,
    pub database_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
}

impl TableRecord {
    pub fn validate(&self) -> Result<(), String> {
        if self.table_name.trim().is_empty() {
            return Err("table_name must not be empty".into());
        }
        if self.database_name.trim().is_empty() {
            return Err("database_name must not be empty".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Record-level access the importer and exporter need. Each upsert is one
/// atomic write.
pub trait ObjectStore {
    fn upsert_database(&mut self, record: &DatabaseRecord) -> Result<UpsertOutcome, StoreError>;
    fn upsert_table(&mut self, record: &TableRecord) -> Result<UpsertOutcome, StoreError>;
    fn list_databases(&self) -> Result<Vec<DatabaseRecord>, StoreError>;
    fn list_tables(&self) -> Result<Vec<TableRecord>, StoreError>;
}
