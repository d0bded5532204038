use crate::objects::ObjectStore;
use anyhow::Context;
use serde::Serialize;
use std::collections::HashSet;
use std::io::{Seek, Write};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

pub const METADATA_ENTRY: &str = "metadata.yaml";
pub const EXPORT_FORMAT: &str = "vizstore-archive-v1";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportSummary {
    pub databases: usize,
    pub tables: usize,
    pub entry_count: usize,
}

#[derive(Serialize)]
struct Metadata<'a> {
    format: &'a str,
    version: &'a str,
    exported_at: String,
    schema_version: Option<&'a str>,
}

fn file_stem(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "unnamed".to_string()
    } else {
        cleaned.to_string()
    }
}

fn unique_path(taken: &mut HashSet<String>, dir: &str, stem: &str) -> String {
    let mut path = format!("{dir}/{stem}.yaml");
    let mut n = 2;
    while !taken.insert(path.clone()) {
        path = format!("{dir}/{stem}-{n}.yaml");
        n += 1;
    }
    path
}

/// Write every database and table descriptor in `store` to a zip archive in
/// the layout the importer reads back.
pub fn export_archive<S, W>(
    store: &S,
    writer: W,
    schema_version: Option<&str>,
) -> anyhow::Result<ExportSummary>
where
    S: ObjectStore + ?Sized,
    W: Write + Seek,
{
    let databases = store.list_databases().context("failed to list databases")?;
    let tables = store.list_tables().context("failed to list tables")?;

    let mut zip = ZipWriter::new(writer);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let metadata = Metadata {
        format: EXPORT_FORMAT,
        version: env!("CARGO_PKG_VERSION"),
        exported_at: chrono::Utc::now().to_rfc3339(),
        schema_version,
    };
    zip.start_file(METADATA_ENTRY, opts)
        .context("failed to start metadata entry")?;
    zip.write_all(
        serde_yaml::to_string(&metadata)
            .context("failed to serialize metadata")?
            .as_bytes(),
    )
    .context("failed to write metadata entry")?;

    let mut taken = HashSet::new();
    for db in &databases {
        let path = unique_path(&mut taken, "databases", &file_stem(&db.database_name));
        zip.start_file(path.as_str(), opts)
            .with_context(|| format!("failed to start entry {path}"))?;
        let text = serde_yaml::to_string(db)
            .with_context(|| format!("failed to serialize database {}", db.database_name))?;
        zip.write_all(text.as_bytes())
            .with_context(|| format!("failed to write entry {path}"))?;
    }
    for table in &tables {
        let dir = format!("tables/{}", file_stem(&table.database_name));
        let path = unique_path(&mut taken, &dir, &file_stem(&table.table_name));
        zip.start_file(path.as_str(), opts)
            .with_context(|| format!("failed to start entry {path}"))?;
        let text = serde_yaml::to_string(table)
            .with_context(|| format!("failed to serialize table {}", table.table_name))?;
        zip.write_all(text.as_bytes())
            .with_context(|| format!("failed to write entry {path}"))?;
    }

    zip.finish().context("failed to finalize zip archive")?;

    tracing::info!(
        databases = databases.len(),
        tables = tables.len(),
        "archive export finished"
    );
    Ok(ExportSummary {
        databases: databases.len(),
        tables: tables.len(),
        entry_count: 1 + databases.len() + tables.len(),
    })
}
