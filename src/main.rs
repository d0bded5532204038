mod archive;
mod config;
mod dashboards;
mod db;
mod ipc;
mod logging;
mod migrate;
mod objects;
mod schema;

use clap::Parser;
use std::io::{self, BufRead, Write};

fn main() {
    let config = config::Config::parse();
    if let Err(e) = logging::init(&config.log_filter) {
        eprintln!("{e:#}");
        std::process::exit(2);
    }

    let chain = match migrate::versions::chain() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "migration chain is invalid");
            std::process::exit(1);
        }
    };
    tracing::info!(head = %chain.head(), "vizstored starting");

    let startup_workspace = config.workspace.clone();
    let mut state = ipc::AppState::new(config, chain);
    if let Some(path) = startup_workspace {
        let resp = ipc::select_workspace(&mut state, "startup", path);
        if resp.get("ok").and_then(|v| v.as_bool()) != Some(true) {
            tracing::error!(response = %resp, "failed to open startup workspace");
        }
    }

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // No id to answer with.
                tracing::warn!(error = %e, "dropping unparseable request");
                let _ = writeln!(
                    stdout,
                    "{}",
                    serde_json::json!({
                        "ok": false,
                        "error": { "code": "bad_json", "message": e.to_string() }
                    })
                );
                let _ = stdout.flush();
                continue;
            }
        };

        tracing::debug!(id = %req.id, method = %req.method, "request");
        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
    tracing::info!("stdin closed, shutting down");
}
