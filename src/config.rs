use clap::Parser;
use std::path::PathBuf;

pub const DEFAULT_DB_FILE: &str = "vizstore.sqlite3";
pub const DEFAULT_MAX_ENTRY_BYTES: u64 = 8 * 1024 * 1024;

/// Startup configuration. Built once in `main` and handed to every component
/// that needs it; nothing reads the environment after this point.
#[derive(Debug, Clone, Parser)]
#[command(name = "vizstored", version, about = "Schema migration and archive import daemon")]
pub struct Config {
    /// Workspace directory to open on startup.
    #[arg(long, env = "VIZSTORED_WORKSPACE")]
    pub workspace: Option<PathBuf>,

    /// SQLite file name inside the workspace directory.
    #[arg(long = "db-file", env = "VIZSTORED_DB_FILE", default_value = DEFAULT_DB_FILE)]
    pub db_file: String,

    /// Tracing filter directives, e.g. `info` or `vizstored=debug`.
    #[arg(long = "log", env = "VIZSTORED_LOG", default_value = "info")]
    pub log_filter: String,

    /// Archive entries larger than this are rejected without being decoded.
    #[arg(long, env = "VIZSTORED_MAX_ENTRY_BYTES", default_value_t = DEFAULT_MAX_ENTRY_BYTES)]
    pub max_entry_bytes: u64,

    /// Upgrade the schema to head whenever a workspace is opened.
    #[arg(long, env = "VIZSTORED_AUTO_UPGRADE", default_value_t = false)]
    pub auto_upgrade: bool,
}

impl Config {
    pub fn import_config(&self) -> ImportConfig {
        ImportConfig {
            max_entry_bytes: self.max_entry_bytes,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ImportConfig {
    pub max_entry_bytes: u64,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            max_entry_bytes: DEFAULT_MAX_ENTRY_BYTES,
        }
    }
}
