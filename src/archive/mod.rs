//! Zip archives of database and table descriptors.
//!
//! Recognized entry names (everything else is skipped and counted):
//!
//! - `databases/<name>.yaml` / `.yml`: one [`DatabaseRecord`]
//! - `tables/<...>.yaml` / `.yml`: one [`TableRecord`]; nested directories
//!   under `tables/` are allowed
//! - either layout wrapped in a single top-level bundle directory, e.g.
//!   `export_20240101/databases/main.yaml`
//!
//! Database entries are imported before table entries, each group in name
//! order, so a table may reference a database from the same archive.

mod export;

pub use export::export_archive;

use crate::config::ImportConfig;
use crate::objects::{DatabaseRecord, ObjectStore, TableRecord, UpsertOutcome};
use crate::schema::StoreError;
use serde::Serialize;
use std::io::{Read, Seek};
use zip::ZipArchive;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Database,
    Table,
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryKind::Database => f.write_str("database"),
            EntryKind::Table => f.write_str("table"),
        }
    }
}

fn kind_for_prefix(prefix: &str) -> Option<EntryKind> {
    match prefix {
        "databases" => Some(EntryKind::Database),
        "tables" => Some(EntryKind::Table),
        _ => None,
    }
}

fn yaml_file(file: &str) -> bool {
    match file.rsplit_once('.') {
        Some((stem, ext)) => {
            !stem.is_empty()
                && (ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
        }
        None => false,
    }
}

fn classify_parts(parts: &[&str]) -> Option<EntryKind> {
    let (prefix, rest) = parts.split_first()?;
    let kind = kind_for_prefix(prefix)?;
    let file = rest.last()?;
    let depth_ok = match kind {
        EntryKind::Database => rest.len() == 1,
        EntryKind::Table => true,
    };
    (depth_ok && yaml_file(file)).then_some(kind)
}

/// Map an entry name to the descriptor it holds, if any.
pub fn classify(name: &str) -> Option<EntryKind> {
    let parts: Vec<&str> = name.split('/').collect();
    if parts.iter().any(|p| p.is_empty() || *p == "..") {
        return None;
    }
    if kind_for_prefix(parts[0]).is_some() {
        return classify_parts(&parts);
    }
    if parts.len() >= 3 {
        return classify_parts(&parts[1..]);
    }
    None
}

#[derive(Debug, thiserror::Error)]
#[error("archive is not a readable zip container: {0}")]
pub struct CorruptArchive(#[from] zip::result::ZipError);

/// Why a single entry could not be imported. Never aborts the import.
#[derive(Debug, thiserror::Error)]
pub enum MalformedEntry {
    #[error("cannot read entry: {0}")]
    Read(String),
    #[error("entry is {size} bytes, limit is {limit}")]
    TooLarge { size: u64, limit: u64 },
    #[error("cannot decode {kind} payload: {source}")]
    Decode {
        kind: EntryKind,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid {kind} payload: {reason}")]
    Invalid { kind: EntryKind, reason: String },
    #[error("write failed: {0}")]
    Write(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub name: String,
    pub kind: EntryKind,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct PlannedEntry {
    kind: EntryKind,
    name: String,
    index: usize,
}

/// Lazily reads the recognized entries of a zip archive in import order.
/// Consuming the iterator is the only way to reach the payloads; each entry
/// is read once. Entries are addressed by position, so two entries sharing a
/// name are both planned and both reported.
pub struct ArchiveEntries<R: Read + Seek> {
    archive: ZipArchive<R>,
    unreadable: std::vec::IntoIter<(String, MalformedEntry)>,
    plan: std::vec::IntoIter<PlannedEntry>,
    skipped: Vec<String>,
    max_entry_bytes: u64,
}

impl<R: Read + Seek> ArchiveEntries<R> {
    pub fn open(reader: R, max_entry_bytes: u64) -> Result<Self, CorruptArchive> {
        let mut archive = ZipArchive::new(reader)?;
        let mut plan = Vec::new();
        let mut skipped = Vec::new();
        let mut unreadable = Vec::new();
        for index in 0..archive.len() {
            let name = match archive.by_index_raw(index) {
                Ok(file) => file.name().to_string(),
                Err(e) => {
                    unreadable.push((
                        format!("<entry {index}>"),
                        MalformedEntry::Read(e.to_string()),
                    ));
                    continue;
                }
            };
            match classify(&name) {
                Some(kind) => plan.push(PlannedEntry { kind, name, index }),
                None => skipped.push(name),
            }
        }
        plan.sort();
        skipped.sort();
        Ok(Self {
            archive,
            unreadable: unreadable.into_iter(),
            plan: plan.into_iter(),
            skipped,
            max_entry_bytes,
        })
    }

    /// Entry names that match no convention.
    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }

    fn read(&mut self, index: usize) -> Result<Vec<u8>, MalformedEntry> {
        let file = self
            .archive
            .by_index(index)
            .map_err(|e| MalformedEntry::Read(e.to_string()))?;
        let size = file.size();
        if size > self.max_entry_bytes {
            return Err(MalformedEntry::TooLarge {
                size,
                limit: self.max_entry_bytes,
            });
        }
        let mut payload = Vec::with_capacity(size as usize);
        // The header size is not trusted; cap what is actually inflated.
        let read = file
            .take(self.max_entry_bytes + 1)
            .read_to_end(&mut payload)
            .map_err(|e| MalformedEntry::Read(e.to_string()))?;
        if read as u64 > self.max_entry_bytes {
            return Err(MalformedEntry::TooLarge {
                size: read as u64,
                limit: self.max_entry_bytes,
            });
        }
        Ok(payload)
    }
}

impl<R: Read + Seek> Iterator for ArchiveEntries<R> {
    type Item = (String, Result<ArchiveEntry, MalformedEntry>);

    fn next(&mut self) -> Option<Self::Item> {
        if let Some((name, reason)) = self.unreadable.next() {
            return Some((name, Err(reason)));
        }
        let PlannedEntry { kind, name, index } = self.plan.next()?;
        let entry = self.read(index).map(|payload| ArchiveEntry {
            name: name.clone(),
            kind,
            payload,
        });
        Some((name, entry))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedEntry {
    pub entry: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub skipped_entries: Vec<String>,
    pub failures: Vec<FailedEntry>,
}

impl ImportSummary {
    fn record_failure(&mut self, entry: &str, reason: &MalformedEntry) {
        tracing::warn!(entry = %entry, error = %reason, "archive entry failed");
        self.failed += 1;
        self.failures.push(FailedEntry {
            entry: entry.to_string(),
            reason: reason.to_string(),
        });
    }
}

fn decode<T: serde::de::DeserializeOwned>(
    kind: EntryKind,
    payload: &[u8],
) -> Result<T, MalformedEntry> {
    serde_yaml::from_slice(payload).map_err(|source| MalformedEntry::Decode { kind, source })
}

fn import_entry<S: ObjectStore + ?Sized>(
    store: &mut S,
    entry: &ArchiveEntry,
) -> Result<UpsertOutcome, MalformedEntry> {
    tracing::debug!(entry = %entry.name, kind = %entry.kind, "importing archive entry");
    match entry.kind {
        EntryKind::Database => {
            let record: DatabaseRecord = decode(entry.kind, &entry.payload)?;
            record.validate().map_err(|reason| MalformedEntry::Invalid {
                kind: entry.kind,
                reason,
            })?;
            Ok(store.upsert_database(&record)?)
        }
        EntryKind::Table => {
            let record: TableRecord = decode(entry.kind, &entry.payload)?;
            record.validate().map_err(|reason| MalformedEntry::Invalid {
                kind: entry.kind,
                reason,
            })?;
            Ok(store.upsert_table(&record)?)
        }
    }
}

/// Import every recognized entry of the zip archive read from `reader`.
///
/// Fails only when the container itself cannot be opened, in which case
/// nothing has been written. Per-entry problems are reported in the summary.
pub fn import_archive<S, R>(
    store: &mut S,
    reader: R,
    config: &ImportConfig,
) -> Result<ImportSummary, CorruptArchive>
where
    S: ObjectStore + ?Sized,
    R: Read + Seek,
{
    let entries = ArchiveEntries::open(reader, config.max_entry_bytes)?;
    let mut summary = ImportSummary {
        skipped: entries.skipped().len(),
        skipped_entries: entries.skipped().to_vec(),
        ..Default::default()
    };
    for name in &summary.skipped_entries {
        tracing::debug!(entry = %name, "skipping archive entry");
    }

    for (name, entry) in entries {
        let outcome = entry.and_then(|entry| import_entry(store, &entry));
        match outcome {
            Ok(UpsertOutcome::Inserted) => summary.inserted += 1,
            Ok(UpsertOutcome::Updated) => summary.updated += 1,
            Err(reason) => summary.record_failure(&name, &reason),
        }
    }

    tracing::info!(
        inserted = summary.inserted,
        updated = summary.updated,
        skipped = summary.skipped,
        failed = summary.failed,
        "archive import finished"
    );
    Ok(summary)
}
