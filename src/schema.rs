//! Structural vocabulary shared by the migrator and the store: column and
//! table specifications, the operations a migration step is made of, and the
//! contract a store must satisfy to have migrations applied against it.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    String { max_len: u32 },
    Timestamp,
    Boolean,
}

impl ColumnType {
    pub fn sql(&self) -> String {
        match self {
            ColumnType::Integer => "INTEGER".to_string(),
            ColumnType::String { max_len } => format!("VARCHAR({max_len})"),
            ColumnType::Timestamp => "DATETIME".to_string(),
            ColumnType::Boolean => "BOOLEAN".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DefaultValue {
    Integer(i64),
    Text(String),
    Boolean(bool),
}

impl DefaultValue {
    pub fn sql(&self) -> String {
        match self {
            DefaultValue::Integer(v) => v.to_string(),
            DefaultValue::Text(s) => format!("'{}'", s.replace('\'', "''")),
            DefaultValue::Boolean(b) => i64::from(*b).to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub table: String,
    pub column: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSpec {
    pub name: String,
    pub ty: ColumnType,
    pub nullable: bool,
    pub primary_key: bool,
    pub foreign_key: Option<ForeignKey>,
    pub default: Option<DefaultValue>,
}

impl ColumnSpec {
    fn new(name: &str, ty: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            ty,
            nullable: true,
            primary_key: false,
            foreign_key: None,
            default: None,
        }
    }

    pub fn integer(name: &str) -> Self {
        Self::new(name, ColumnType::Integer)
    }

    pub fn string(name: &str, max_len: u32) -> Self {
        Self::new(name, ColumnType::String { max_len })
    }

    pub fn timestamp(name: &str) -> Self {
        Self::new(name, ColumnType::Timestamp)
    }

    pub fn boolean(name: &str) -> Self {
        Self::new(name, ColumnType::Boolean)
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn references(mut self, table: &str, column: &str) -> Self {
        self.foreign_key = Some(ForeignKey {
            table: table.to_string(),
            column: column.to_string(),
        });
        self
    }

    #[cfg(test)]
    pub fn default_value(mut self, value: DefaultValue) -> Self {
        self.default = Some(value);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableSpec {
    pub name: String,
    pub columns: Vec<ColumnSpec>,
    pub unique: Vec<Vec<String>>,
}

impl TableSpec {
    pub fn new(name: &str, columns: Vec<ColumnSpec>) -> Self {
        Self {
            name: name.to_string(),
            columns,
            unique: Vec::new(),
        }
    }

    pub fn unique(mut self, columns: &[&str]) -> Self {
        self.unique.push(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchemaOp {
    CreateTable(TableSpec),
    DropTable { table: String },
    AddColumn { table: String, column: ColumnSpec },
    DropColumn { table: String, column: String },
}

impl SchemaOp {
    pub fn create_table(spec: TableSpec) -> Self {
        SchemaOp::CreateTable(spec)
    }

    pub fn drop_table(table: &str) -> Self {
        SchemaOp::DropTable {
            table: table.to_string(),
        }
    }

    pub fn add_column(table: &str, column: ColumnSpec) -> Self {
        SchemaOp::AddColumn {
            table: table.to_string(),
            column,
        }
    }

    pub fn drop_column(table: &str, column: &str) -> Self {
        SchemaOp::DropColumn {
            table: table.to_string(),
            column: column.to_string(),
        }
    }
}

impl fmt::Display for SchemaOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaOp::CreateTable(spec) => write!(f, "create table '{}'", spec.name),
            SchemaOp::DropTable { table } => write!(f, "drop table '{table}'"),
            SchemaOp::AddColumn { table, column } => {
                write!(f, "add column '{}' to table '{table}'", column.name)
            }
            SchemaOp::DropColumn { table, column } => {
                write!(f, "drop column '{column}' from table '{table}'")
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("{what} '{key}' not found")]
    NotFound { what: &'static str, key: String },
    #[error("invalid record: {0}")]
    Invalid(String),
}

/// A structural conflict between a schema operation and the store it is
/// applied to. Checked before the store is touched.
#[derive(Debug, thiserror::Error)]
pub enum StructuralError {
    #[error("table '{table}' already exists")]
    TableExists { table: String },
    #[error("table '{table}' does not exist")]
    TableMissing { table: String },
    #[error("column '{column}' already exists on table '{table}'")]
    ColumnExists { table: String, column: String },
    #[error("column '{column}' does not exist on table '{table}'")]
    ColumnMissing { table: String, column: String },
    #[error("column '{column}' on non-empty table '{table}' is NOT NULL but the step supplies no default")]
    MissingDefault { table: String, column: String },
    #[error("column '{column}' on table '{table}' references missing {target_table}.{target_column}")]
    MissingReference {
        table: String,
        column: String,
        target_table: String,
        target_column: String,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Everything the migrator needs from a persistent store. Mutations assume
/// the caller already validated them; `apply_op` does that validation.
pub trait SchemaStore {
    fn has_table(&self, table: &str) -> Result<bool, StoreError>;
    fn has_column(&self, table: &str, column: &str) -> Result<bool, StoreError>;
    fn row_count(&self, table: &str) -> Result<u64, StoreError>;

    fn create_table(&mut self, spec: &TableSpec) -> Result<(), StoreError>;
    fn drop_table(&mut self, table: &str) -> Result<(), StoreError>;
    fn add_column(&mut self, table: &str, column: &ColumnSpec) -> Result<(), StoreError>;
    fn drop_column(&mut self, table: &str, column: &str) -> Result<(), StoreError>;

    fn current_version(&self) -> Result<Option<String>, StoreError>;
    fn set_version(&mut self, version: Option<&str>) -> Result<(), StoreError>;

    fn begin_step(&mut self) -> Result<(), StoreError>;
    fn commit_step(&mut self) -> Result<(), StoreError>;
    fn rollback_step(&mut self) -> Result<(), StoreError>;
}

fn check_reference<S: SchemaStore + ?Sized>(
    store: &S,
    table: &str,
    column: &ColumnSpec,
    creating: Option<&TableSpec>,
) -> Result<(), StructuralError> {
    let Some(fk) = column.foreign_key.as_ref() else {
        return Ok(());
    };
    let present = match creating {
        Some(spec) if spec.name == fk.table => spec.column(&fk.column).is_some(),
        _ => store.has_table(&fk.table)? && store.has_column(&fk.table, &fk.column)?,
    };
    if present {
        Ok(())
    } else {
        Err(StructuralError::MissingReference {
            table: table.to_string(),
            column: column.name.clone(),
            target_table: fk.table.clone(),
            target_column: fk.column.clone(),
        })
    }
}

/// Validate `op` against the current state of `store`, then apply it.
pub fn apply_op<S: SchemaStore + ?Sized>(
    store: &mut S,
    op: &SchemaOp,
) -> Result<(), StructuralError> {
    match op {
        SchemaOp::CreateTable(spec) => {
            if store.has_table(&spec.name)? {
                return Err(StructuralError::TableExists {
                    table: spec.name.clone(),
                });
            }
            for column in &spec.columns {
                check_reference(store, &spec.name, column, Some(spec))?;
            }
            store.create_table(spec)?;
        }
        SchemaOp::DropTable { table } => {
            if !store.has_table(table)? {
                return Err(StructuralError::TableMissing {
                    table: table.clone(),
                });
            }
            store.drop_table(table)?;
        }
        SchemaOp::AddColumn { table, column } => {
            if !store.has_table(table)? {
                return Err(StructuralError::TableMissing {
                    table: table.clone(),
                });
            }
            if store.has_column(table, &column.name)? {
                return Err(StructuralError::ColumnExists {
                    table: table.clone(),
                    column: column.name.clone(),
                });
            }
            if !column.nullable && column.default.is_none() && store.row_count(table)? > 0 {
                return Err(StructuralError::MissingDefault {
                    table: table.clone(),
                    column: column.name.clone(),
                });
            }
            check_reference(store, table, column, None)?;
            store.add_column(table, column)?;
        }
        SchemaOp::DropColumn { table, column } => {
            if !store.has_table(table)? {
                return Err(StructuralError::TableMissing {
                    table: table.clone(),
                });
            }
            if !store.has_column(table, column)? {
                return Err(StructuralError::ColumnMissing {
                    table: table.clone(),
                    column: column.clone(),
                });
            }
            store.drop_column(table, column)?;
        }
    }
    Ok(())
}
