//! The migration chain compiled into the daemon, oldest step first.

use super::{ChainError, MigrationStep, StepChain};
use crate::schema::{ColumnSpec, SchemaOp, TableSpec};

pub const BASELINE: &str = "def97f26fdfb";
pub const AUTOMATIC_DASHBOARDS: &str = "88d251d02040";
pub const MULTI_DATASOURCE_SLICES: &str = "57794a86230b";

fn id() -> ColumnSpec {
    ColumnSpec::integer("id").primary_key()
}

fn timestamps() -> Vec<ColumnSpec> {
    vec![
        ColumnSpec::timestamp("created_on"),
        ColumnSpec::timestamp("changed_on"),
    ]
}

fn audit_users() -> Vec<ColumnSpec> {
    vec![
        ColumnSpec::integer("created_by_fk").references("ab_user", "id"),
        ColumnSpec::integer("changed_by_fk").references("ab_user", "id"),
    ]
}

fn table(name: &str, parts: Vec<Vec<ColumnSpec>>) -> TableSpec {
    TableSpec::new(name, parts.into_iter().flatten().collect())
}

fn baseline() -> MigrationStep {
    let ab_user = TableSpec::new(
        "ab_user",
        vec![
            id(),
            ColumnSpec::string("first_name", 64).not_null(),
            ColumnSpec::string("last_name", 64).not_null(),
            ColumnSpec::string("username", 64).not_null(),
        ],
    )
    .unique(&["username"]);

    let dbs = table(
        "dbs",
        vec![
            timestamps(),
            vec![
                id(),
                ColumnSpec::string("database_name", 250).not_null(),
                ColumnSpec::string("sqlalchemy_uri", 1024),
                ColumnSpec::boolean("expose_in_sqllab"),
                ColumnSpec::boolean("allow_run_async"),
                ColumnSpec::boolean("allow_dml"),
                ColumnSpec::integer("cache_timeout"),
                ColumnSpec::string("extra", 5000),
            ],
            audit_users(),
        ],
    )
    .unique(&["database_name"]);

    let tables = table(
        "tables",
        vec![
            timestamps(),
            vec![
                id(),
                ColumnSpec::string("table_name", 250).not_null(),
                ColumnSpec::integer("database_id")
                    .not_null()
                    .references("dbs", "id"),
                ColumnSpec::string("schema", 255),
                ColumnSpec::string("description", 5000),
                ColumnSpec::string("sql", 10000),
            ],
            audit_users(),
        ],
    )
    .unique(&["database_id", "table_name"]);

    let datasources = table(
        "datasources",
        vec![
            timestamps(),
            vec![id(), ColumnSpec::string("datasource_name", 255)],
        ],
    )
    .unique(&["datasource_name"]);

    let slices = table(
        "slices",
        vec![
            timestamps(),
            vec![
                id(),
                ColumnSpec::string("slice_name", 250),
                ColumnSpec::integer("datasource_id"),
                ColumnSpec::string("datasource_name", 2000),
                ColumnSpec::string("datasource_type", 200),
                ColumnSpec::string("viz_type", 250),
                ColumnSpec::string("params", 10000),
                ColumnSpec::string("perm", 2000),
            ],
            audit_users(),
        ],
    );

    let dashboards = table(
        "dashboards",
        vec![
            timestamps(),
            vec![
                id(),
                ColumnSpec::string("dashboard_title", 500),
                ColumnSpec::string("slug", 255),
                ColumnSpec::boolean("published"),
            ],
            audit_users(),
        ],
    )
    .unique(&["slug"]);

    let dashboard_user = TableSpec::new(
        "dashboard_user",
        vec![
            id(),
            ColumnSpec::integer("user_id").references("ab_user", "id"),
            ColumnSpec::integer("dashboard_id").references("dashboards", "id"),
        ],
    );

    MigrationStep {
        id: BASELINE.to_string(),
        predecessor: None,
        description: "baseline metadata schema".to_string(),
        forward: vec![
            SchemaOp::create_table(ab_user),
            SchemaOp::create_table(dbs),
            SchemaOp::create_table(tables),
            SchemaOp::create_table(datasources),
            SchemaOp::create_table(slices),
            SchemaOp::create_table(dashboards),
            SchemaOp::create_table(dashboard_user),
        ],
        inverse: vec![
            SchemaOp::drop_table("dashboard_user"),
            SchemaOp::drop_table("dashboards"),
            SchemaOp::drop_table("slices"),
            SchemaOp::drop_table("datasources"),
            SchemaOp::drop_table("tables"),
            SchemaOp::drop_table("dbs"),
            SchemaOp::drop_table("ab_user"),
        ],
    }
}

fn automatic_dashboards() -> MigrationStep {
    let automatic_dashboards = table(
        "automatic_dashboards",
        vec![
            timestamps(),
            vec![
                id().references("dashboards", "id"),
                ColumnSpec::string("datasource_type", 200),
                ColumnSpec::string("viz_type", 250),
            ],
            audit_users(),
        ],
    );

    let database_groups = table(
        "database_groups",
        vec![
            timestamps(),
            vec![
                id(),
                ColumnSpec::string("name", 250),
                ColumnSpec::integer("dashboard_id").references("automatic_dashboards", "id"),
            ],
            audit_users(),
        ],
    )
    .unique(&["dashboard_id"])
    .unique(&["name"]);

    let databases_groups = TableSpec::new(
        "databases_groups",
        vec![
            id(),
            ColumnSpec::integer("database_group_id").references("database_groups", "id"),
            ColumnSpec::integer("database_id").references("dbs", "id"),
        ],
    )
    .unique(&["database_group_id", "database_id"]);

    MigrationStep {
        id: AUTOMATIC_DASHBOARDS.to_string(),
        predecessor: Some(BASELINE.to_string()),
        description: "add automatic dashboards and database groups".to_string(),
        forward: vec![
            SchemaOp::create_table(automatic_dashboards),
            SchemaOp::create_table(database_groups),
            SchemaOp::create_table(databases_groups),
        ],
        inverse: vec![
            SchemaOp::drop_table("databases_groups"),
            SchemaOp::drop_table("database_groups"),
            SchemaOp::drop_table("automatic_dashboards"),
        ],
    }
}

fn multi_datasource_slices() -> MigrationStep {
    let slice_perms = table(
        "slice_perms",
        vec![
            timestamps(),
            vec![
                id(),
                ColumnSpec::integer("slice_id").references("slices", "id"),
                ColumnSpec::string("perm", 1000),
            ],
            audit_users(),
        ],
    );

    let druid_link = TableSpec::new(
        "slice__druid_datasource",
        vec![
            id(),
            ColumnSpec::integer("datasource_id").references("datasources", "id"),
            ColumnSpec::integer("slice_id").references("slices", "id"),
        ],
    );

    let table_link = TableSpec::new(
        "slice__table_datasource",
        vec![
            id(),
            ColumnSpec::integer("datasource_id").references("tables", "id"),
            ColumnSpec::integer("slice_id").references("slices", "id"),
        ],
    );

    MigrationStep {
        id: MULTI_DATASOURCE_SLICES.to_string(),
        predecessor: Some(AUTOMATIC_DASHBOARDS.to_string()),
        description: "multi datasource support for slices".to_string(),
        forward: vec![
            SchemaOp::create_table(slice_perms),
            SchemaOp::create_table(druid_link),
            SchemaOp::create_table(table_link),
            SchemaOp::drop_column("slices", "datasource_id"),
            SchemaOp::drop_column("slices", "datasource_name"),
            SchemaOp::drop_column("slices", "perm"),
        ],
        inverse: vec![
            SchemaOp::add_column("slices", ColumnSpec::string("datasource_name", 2000)),
            SchemaOp::add_column("slices", ColumnSpec::string("perm", 2000)),
            SchemaOp::add_column("slices", ColumnSpec::integer("datasource_id")),
            SchemaOp::drop_table("slice__table_datasource"),
            SchemaOp::drop_table("slice__druid_datasource"),
            SchemaOp::drop_table("slice_perms"),
        ],
    }
}

pub fn steps() -> Vec<MigrationStep> {
    vec![baseline(), automatic_dashboards(), multi_datasource_slices()]
}

pub fn chain() -> Result<StepChain, ChainError> {
    StepChain::new(steps())
}
