use rusqlite::Connection;
use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_vizstored");
    let mut child = Command::new(exe)
        .env_remove("VIZSTORED_WORKSPACE")
        .env_remove("VIZSTORED_AUTO_UPGRADE")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn vizstored");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> Option<&str> {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
}

fn seed(workspace: &Path) -> (i64, i64, i64) {
    let conn = Connection::open(workspace.join("vizstore.sqlite3")).expect("open db");
    conn.execute(
        "INSERT INTO ab_user(first_name, last_name, username) VALUES('Ada', 'Admin', 'admin')",
        [],
    )
    .expect("insert user");
    let user = conn.last_insert_rowid();
    conn.execute(
        "INSERT INTO dbs(database_name, sqlalchemy_uri) VALUES('examples', 'sqlite://')",
        [],
    )
    .expect("insert db");
    let examples = conn.last_insert_rowid();
    conn.execute(
        "INSERT INTO dbs(database_name, sqlalchemy_uri) VALUES('warehouse', 'postgresql://dw')",
        [],
    )
    .expect("insert db");
    let warehouse = conn.last_insert_rowid();
    (user, examples, warehouse)
}

#[test]
fn automatic_dashboard_binds_its_group() {
    let workspace = temp_dir("vizstore-auto-dash");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(&mut stdin, &mut reader, "2", "schema.upgrade", json!({}));
    let (user, examples, warehouse) = seed(&workspace);

    let group = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "databaseGroups.create",
        json!({ "name": "core", "databaseIds": [examples, warehouse, examples] }),
    );
    let group_id = group
        .get("groupId")
        .and_then(|v| v.as_i64())
        .expect("groupId");

    let duplicate_group = request(
        &mut stdin,
        &mut reader,
        "4",
        "databaseGroups.create",
        json!({ "name": "core", "databaseIds": [examples] }),
    );
    assert_eq!(error_code(&duplicate_group), Some("conflict"));

    let no_title = request(
        &mut stdin,
        &mut reader,
        "5",
        "dashboards.createAutomatic",
        json!({ "title": "  ", "groupId": group_id }),
    );
    assert_eq!(error_code(&no_title), Some("bad_params"));

    let no_group = request(
        &mut stdin,
        &mut reader,
        "6",
        "dashboards.createAutomatic",
        json!({ "title": "Overview" }),
    );
    assert_eq!(error_code(&no_group), Some("bad_params"));

    let created = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "dashboards.createAutomatic",
        json!({
            "title": "Overview",
            "groupId": group_id,
            "slug": "overview",
            "ownerIds": [user],
            "published": true
        }),
    );
    let dashboard_id = created
        .get("dashboardId")
        .and_then(|v| v.as_i64())
        .expect("dashboardId");

    let reused = request(
        &mut stdin,
        &mut reader,
        "8",
        "dashboards.createAutomatic",
        json!({ "title": "Second", "groupId": group_id }),
    );
    assert_eq!(error_code(&reused), Some("conflict"));

    let other_group = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "databaseGroups.create",
        json!({ "name": "warehouse only", "databaseIds": [warehouse] }),
    )
    .get("groupId")
    .and_then(|v| v.as_i64())
    .expect("groupId");
    let slug_taken = request(
        &mut stdin,
        &mut reader,
        "10",
        "dashboards.createAutomatic",
        json!({ "title": "Again", "groupId": other_group, "slug": "overview" }),
    );
    assert_eq!(error_code(&slug_taken), Some("conflict"));

    let unknown_owner = request(
        &mut stdin,
        &mut reader,
        "11",
        "dashboards.createAutomatic",
        json!({ "title": "Again", "groupId": other_group, "ownerIds": [9999] }),
    );
    assert_eq!(error_code(&unknown_owner), Some("not_found"));

    let conn = Connection::open(workspace.join("vizstore.sqlite3")).expect("open db");
    let bound: Option<i64> = conn
        .query_row(
            "SELECT dashboard_id FROM database_groups WHERE id = ?",
            [group_id],
            |r| r.get(0),
        )
        .expect("read group");
    assert_eq!(bound, Some(dashboard_id));
    let members: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM databases_groups WHERE database_group_id = ?",
            [group_id],
            |r| r.get(0),
        )
        .expect("count members");
    assert_eq!(members, 2);
    let owners: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM dashboard_user WHERE dashboard_id = ?",
            [dashboard_id],
            |r| r.get(0),
        )
        .expect("count owners");
    assert_eq!(owners, 1);
    let dashboards: i64 = conn
        .query_row("SELECT COUNT(*) FROM dashboards", [], |r| r.get(0))
        .expect("count dashboards");
    assert_eq!(dashboards, 1);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
