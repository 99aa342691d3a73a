use rusqlite::Connection;
use serde_json::json;
use std::io::{BufRead, BufReader, Write as IoWrite};
use std::path::PathBuf;
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
    let exe = env!("CARGO_BIN_EXE_gradehubd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn gradehubd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn write_zip(path: &PathBuf, entries: &[(&str, &[u8])]) {
    let file = std::fs::File::create(path).expect("create zip");
    let mut zip = ZipWriter::new(file);
    let opts = FileOptions::default();
    for (name, bytes) in entries {
        zip.start_file(*name, opts).expect("start entry");
        zip.write_all(bytes).expect("write entry");
    }
    zip.finish().expect("finish zip");
}

#[test]
fn filename_metadata_and_unmatched_paths() {
    let workspace = temp_dir("gradehub-resolver");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let course = request_ok(
        &mut stdin,
        &mut reader,
        "c1",
        "courses.create",
        json!({ "name": "Spreadsheets 101", "term": "F26" }),
    );
    let course_id = course["courseId"].as_str().expect("courseId").to_string();
    request_ok(
        &mut stdin,
        &mut reader,
        "r1",
        "roster.import",
        json!({
            "courseId": course_id,
            "students": [
                { "studentId": "S10293", "name": "Doe, Jane" },
                { "studentId": "S55555", "name": "Smith, Alex" }
            ]
        }),
    );
    let assignment = request_ok(
        &mut stdin,
        &mut reader,
        "a1",
        "assignments.create",
        json!({ "courseId": course_id, "title": "HW1" }),
    );
    let assignment_id = assignment["assignmentId"].as_str().expect("id").to_string();

    // Exact roster id embedded in the archive name.
    let by_id = workspace.join("S10293_hw1.zip");
    write_zip(&by_id, &[("work.txt", b"content one".as_slice())]);

    // Nothing recognizable in the name or the content.
    let anon = workspace.join("final_submission.zip");
    write_zip(&anon, &[("work.txt", b"content two".as_slice())]);

    // Identifier only inside a marker file.
    let marked = workspace.join("who_is_this.zip");
    write_zip(
        &marked,
        &[
            ("work.txt", b"content three".as_slice()),
            ("student_id.txt", b"S55555\n".as_slice()),
        ],
    );

    let res = request_ok(
        &mut stdin,
        &mut reader,
        "i1",
        "submissions.import",
        json!({
            "assignmentId": assignment_id,
            "archivePaths": [
                by_id.to_string_lossy(),
                anon.to_string_lossy(),
                marked.to_string_lossy()
            ]
        }),
    );
    let results = res["results"].as_array().expect("results");
    assert_eq!(results.len(), 3);
    assert_eq!(results[0]["status"], "imported");
    assert_eq!(results[0]["studentId"], "S10293");
    assert_eq!(results[1]["status"], "imported");
    assert!(results[1]["studentId"].is_null());
    assert_eq!(results[2]["status"], "imported");
    assert_eq!(results[2]["studentId"], "S55555");

    let conn = Connection::open(workspace.join("gradehub.sqlite3")).expect("open db");
    let (method, confidence): (String, f64) = conn
        .query_row(
            "SELECT match_method, match_confidence FROM submissions WHERE student_id = 'S10293'",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .expect("matched row");
    assert_eq!(method, "filename");
    assert_eq!(confidence, 1.0);

    let (method, confidence): (String, f64) = conn
        .query_row(
            "SELECT match_method, match_confidence FROM submissions WHERE student_id = 'S55555'",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .expect("metadata row");
    assert_eq!(method, "metadata");
    assert!((confidence - 0.9).abs() < 1e-9);

    let (method, confidence): (String, f64) = conn
        .query_row(
            "SELECT match_method, match_confidence FROM submissions WHERE student_id IS NULL",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .expect("unmatched row");
    assert_eq!(method, "none");
    assert_eq!(confidence, 0.0);

    // Only the anonymous one sits in the manual queue.
    let unmatched = request_ok(
        &mut stdin,
        &mut reader,
        "u1",
        "submissions.listUnmatched",
        json!({ "assignmentId": assignment_id }),
    );
    let queue = unmatched["submissions"].as_array().expect("queue");
    assert_eq!(queue.len(), 1);
    assert!(queue[0]["sourcePath"]
        .as_str()
        .expect("sourcePath")
        .ends_with("final_submission.zip"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn fuzzy_name_match_sets_scaled_confidence() {
    let workspace = temp_dir("gradehub-fuzzy");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let course = request_ok(
        &mut stdin,
        &mut reader,
        "c1",
        "courses.create",
        json!({ "name": "Spreadsheets 101", "term": "F26" }),
    );
    let course_id = course["courseId"].as_str().expect("courseId").to_string();
    request_ok(
        &mut stdin,
        &mut reader,
        "r1",
        "roster.import",
        json!({
            "courseId": course_id,
            "students": [
                { "studentId": "S10293", "name": "Doe, Jane" },
                { "studentId": "S55555", "name": "Smith, Alex" }
            ]
        }),
    );
    let assignment = request_ok(
        &mut stdin,
        &mut reader,
        "a1",
        "assignments.create",
        json!({ "courseId": course_id, "title": "HW1" }),
    );
    let assignment_id = assignment["assignmentId"].as_str().expect("id").to_string();

    let archive = workspace.join("jane_doe_hw1.zip");
    write_zip(&archive, &[("work.txt", b"fuzzy content".as_slice())]);
    let res = request_ok(
        &mut stdin,
        &mut reader,
        "i1",
        "submissions.import",
        json!({ "assignmentId": assignment_id, "archivePaths": [archive.to_string_lossy()] }),
    );
    assert_eq!(res["results"][0]["studentId"], "S10293");

    let conn = Connection::open(workspace.join("gradehub.sqlite3")).expect("open db");
    let (method, confidence): (String, f64) = conn
        .query_row(
            "SELECT match_method, match_confidence FROM submissions WHERE student_id = 'S10293'",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .expect("fuzzy row");
    assert_eq!(method, "filename");
    assert!(confidence >= 0.82, "confidence {} below threshold", confidence);

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
