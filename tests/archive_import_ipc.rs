use rusqlite::Connection;
use serde_json::json;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};
use zip::write::FileOptions;
use zip::ZipWriter;

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
        .env_remove("VIZSTORED_MAX_ENTRY_BYTES")
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

fn write_zip(path: &Path, entries: &[(&str, &str)]) {
    let f = File::create(path).expect("create zip file");
    let mut zip = ZipWriter::new(f);
    for (name, body) in entries {
        zip.start_file(*name, FileOptions::default())
            .expect("start entry");
        zip.write_all(body.as_bytes()).expect("write entry");
    }
    zip.finish().expect("finish zip");
}

fn count(conn: &Connection, table: &str) -> i64 {
    conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))
        .expect("count rows")
}

fn as_u64(result: &serde_json::Value, key: &str) -> Option<u64> {
    result.get(key).and_then(|v| v.as_u64())
}

fn select_and_upgrade(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &Path,
) {
    let _ = request_ok(
        stdin,
        reader,
        "select",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let _ = request_ok(stdin, reader, "upgrade", "schema.upgrade", json!({}));
}

#[test]
fn import_requires_schema_at_head() {
    let workspace = temp_dir("vizstore-archive-stale");
    let archive = workspace.join("in.zip");
    write_zip(
        &archive,
        &[(
            "databases/examples.yaml",
            "database_name: examples\nsqlalchemy_uri: sqlite://\n",
        )],
    );

    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let resp = request(
        &mut stdin,
        &mut reader,
        "2",
        "archive.import",
        json!({ "path": archive.to_string_lossy() }),
    );
    assert_eq!(error_code(&resp), Some("schema_out_of_date"));
    assert_eq!(
        resp.get("error")
            .and_then(|e| e.get("details"))
            .and_then(|d| d.get("current"))
            .and_then(|v| v.as_str()),
        Some("base")
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn malformed_entries_are_reported_and_the_rest_imported() {
    let workspace = temp_dir("vizstore-archive-import");
    let archive = workspace.join("bundle.zip");
    write_zip(
        &archive,
        &[
            ("tables/warehouse/sales.yaml", "table_name: sales\ndatabase_name: warehouse\n"),
            (
                "databases/examples.yaml",
                "database_name: examples\nsqlalchemy_uri: sqlite:///examples.db\n",
            ),
            (
                "databases/warehouse.yaml",
                "database_name: warehouse\nsqlalchemy_uri: postgresql://dw/warehouse\n",
            ),
            ("databases/broken.yaml", "database_name: [oops\n"),
            ("README.txt", "not a descriptor"),
        ],
    );

    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    select_and_upgrade(&mut stdin, &mut reader, &workspace);

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "archive.import",
        json!({ "path": archive.to_string_lossy() }),
    );
    assert_eq!(as_u64(&summary, "inserted"), Some(3));
    assert_eq!(as_u64(&summary, "updated"), Some(0));
    assert_eq!(as_u64(&summary, "failed"), Some(1));
    assert_eq!(as_u64(&summary, "skipped"), Some(1));
    let failures = summary
        .get("failures")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    assert_eq!(failures.len(), 1);
    assert_eq!(
        failures[0].get("entry").and_then(|v| v.as_str()),
        Some("databases/broken.yaml")
    );

    let conn = Connection::open(workspace.join("vizstore.sqlite3")).expect("open db");
    assert_eq!(count(&conn, "dbs"), 2);
    assert_eq!(count(&conn, "tables"), 1);

    let listed = request_ok(&mut stdin, &mut reader, "2", "tables.list", json!({}));
    assert_eq!(
        listed
            .get("tables")
            .and_then(|v| v.as_array())
            .and_then(|a| a.first())
            .and_then(|t| t.get("database_name"))
            .and_then(|v| v.as_str()),
        Some("warehouse")
    );

    let again = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "archive.import",
        json!({ "path": archive.to_string_lossy() }),
    );
    assert_eq!(as_u64(&again, "inserted"), Some(0));
    assert_eq!(as_u64(&again, "updated"), Some(3));
    assert_eq!(count(&conn, "dbs"), 2);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn corrupt_archive_is_rejected_before_any_write() {
    let workspace = temp_dir("vizstore-archive-corrupt");
    let archive = workspace.join("corrupt.zip");
    std::fs::write(&archive, b"PK\x03\x04 truncated garbage").expect("write corrupt file");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    select_and_upgrade(&mut stdin, &mut reader, &workspace);

    let resp = request(
        &mut stdin,
        &mut reader,
        "1",
        "archive.import",
        json!({ "path": archive.to_string_lossy() }),
    );
    assert_eq!(error_code(&resp), Some("corrupt_archive"));

    let missing = request(
        &mut stdin,
        &mut reader,
        "2",
        "archive.import",
        json!({ "path": workspace.join("nope.zip").to_string_lossy() }),
    );
    assert_eq!(error_code(&missing), Some("io_failed"));

    let conn = Connection::open(workspace.join("vizstore.sqlite3")).expect("open db");
    assert_eq!(count(&conn, "dbs"), 0);
    assert_eq!(count(&conn, "tables"), 0);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn export_produces_an_importable_archive() {
    let source = temp_dir("vizstore-archive-export-src");
    let target = temp_dir("vizstore-archive-export-dst");
    let archive = source.join("seed.zip");
    let exported = source.join("out/export.zip");
    write_zip(
        &archive,
        &[
            (
                "databases/examples.yaml",
                "database_name: examples\nsqlalchemy_uri: sqlite:///examples.db\ncache_timeout: 60\n",
            ),
            (
                "tables/birth_names.yaml",
                "table_name: birth_names\ndatabase_name: examples\nschema: main\n",
            ),
        ],
    );

    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    select_and_upgrade(&mut stdin, &mut reader, &source);
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "archive.import",
        json!({ "path": archive.to_string_lossy() }),
    );
    let export = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "archive.export",
        json!({ "outPath": exported.to_string_lossy() }),
    );
    assert_eq!(as_u64(&export, "databases"), Some(1));
    assert_eq!(as_u64(&export, "tables"), Some(1));

    let mut zip = zip::ZipArchive::new(File::open(&exported).expect("open export"))
        .expect("read export zip");
    let mut metadata = String::new();
    zip.by_name("metadata.yaml")
        .expect("metadata entry")
        .read_to_string(&mut metadata)
        .expect("read metadata");
    assert!(metadata.contains("57794a86230b"));

    select_and_upgrade(&mut stdin, &mut reader, &target);
    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "archive.import",
        json!({ "path": exported.to_string_lossy() }),
    );
    assert_eq!(as_u64(&summary, "inserted"), Some(2));
    assert_eq!(as_u64(&summary, "failed"), Some(0));

    let dbs = request_ok(&mut stdin, &mut reader, "4", "databases.list", json!({}));
    let first = dbs
        .get("databases")
        .and_then(|v| v.as_array())
        .and_then(|a| a.first())
        .cloned()
        .expect("one database");
    assert_eq!(first.get("database_name").and_then(|v| v.as_str()), Some("examples"));
    assert_eq!(first.get("cache_timeout").and_then(|v| v.as_i64()), Some(60));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(source);
    let _ = std::fs::remove_dir_all(target);
}
