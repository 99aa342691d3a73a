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

/// Raw round-trip; callers assert ok/error themselves.
fn request(
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
    serde_json::from_str(line.trim()).expect("parse response json")
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
fn manual_match_is_idempotent_and_course_scoped() {
    let workspace = temp_dir("gradehub-manual");
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
            "students": [{ "studentId": "S10293", "name": "Doe, Jane" }]
        }),
    );
    // A second course whose roster must be out of scope here.
    let other = request_ok(
        &mut stdin,
        &mut reader,
        "c2",
        "courses.create",
        json!({ "name": "Other Course", "term": "F26" }),
    );
    let other_id = other["courseId"].as_str().expect("courseId").to_string();
    request_ok(
        &mut stdin,
        &mut reader,
        "r2",
        "roster.import",
        json!({
            "courseId": other_id,
            "students": [{ "studentId": "X99999", "name": "Elsewhere, Casey" }]
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

    let archive = workspace.join("nameless.zip");
    write_zip(&archive, &[("work.txt", b"anon content".as_slice())]);
    request_ok(
        &mut stdin,
        &mut reader,
        "i1",
        "submissions.import",
        json!({ "assignmentId": assignment_id, "archivePaths": [archive.to_string_lossy()] }),
    );

    let conn = Connection::open(workspace.join("gradehub.sqlite3")).expect("open db");
    let submission_id: String = conn
        .query_row("SELECT id FROM submissions", [], |r| r.get(0))
        .expect("submission row");

    // A student from another course is rejected.
    let resp = request(
        &mut stdin,
        &mut reader,
        "m0",
        "submissions.manualMatch",
        json!({ "submissionId": submission_id, "studentId": "X99999", "actorId": "ta-1" }),
    );
    assert_eq!(resp["ok"], false);
    assert_eq!(resp["error"]["code"], "not_found");

    // Same call twice: same end state, one audit entry per call.
    for (i, id) in ["m1", "m2"].iter().enumerate() {
        let resp = request_ok(
            &mut stdin,
            &mut reader,
            id,
            "submissions.manualMatch",
            json!({ "submissionId": submission_id, "studentId": "S10293", "actorId": "ta-1" }),
        );
        assert_eq!(resp["ok"], true, "call {} failed", i);
    }

    let (student, method, confidence): (Option<String>, String, f64) = conn
        .query_row(
            "SELECT student_id, match_method, match_confidence FROM submissions WHERE id = ?",
            [&submission_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .expect("submission state");
    assert_eq!(student.as_deref(), Some("S10293"));
    assert_eq!(method, "manual");
    assert_eq!(confidence, 1.0);

    let audits: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM audit_log WHERE action = 'submission.manual_match' AND entity_id = ?",
            [&submission_id],
            |r| r.get(0),
        )
        .expect("audit count");
    assert_eq!(audits, 2, "exactly one audit entry per call");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn quarantine_flags_and_leaves_the_manual_queue() {
    let workspace = temp_dir("gradehub-quarantine");
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
    let assignment = request_ok(
        &mut stdin,
        &mut reader,
        "a1",
        "assignments.create",
        json!({ "courseId": course_id, "title": "HW1" }),
    );
    let assignment_id = assignment["assignmentId"].as_str().expect("id").to_string();

    let archive = workspace.join("garbled.zip");
    write_zip(&archive, &[("work.txt", b"unidentifiable".as_slice())]);
    request_ok(
        &mut stdin,
        &mut reader,
        "i1",
        "submissions.import",
        json!({ "assignmentId": assignment_id, "archivePaths": [archive.to_string_lossy()] }),
    );

    let conn = Connection::open(workspace.join("gradehub.sqlite3")).expect("open db");
    let submission_id: String = conn
        .query_row("SELECT id FROM submissions", [], |r| r.get(0))
        .expect("submission row");

    for id in ["q1", "q2"] {
        request_ok(
            &mut stdin,
            &mut reader,
            id,
            "submissions.quarantine",
            json!({
                "submissionId": submission_id,
                "reason": "two names on the cover sheet",
                "actorId": "ta-1"
            }),
        );
    }

    let (status, student, notes): (String, Option<String>, Option<String>) = conn
        .query_row(
            "SELECT status, student_id, notes FROM submissions WHERE id = ?",
            [&submission_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .expect("submission state");
    assert_eq!(status, "flagged");
    assert!(student.is_none(), "quarantine never assigns a student");
    assert_eq!(notes.as_deref(), Some("two names on the cover sheet"));

    let unmatched = request_ok(
        &mut stdin,
        &mut reader,
        "u1",
        "submissions.listUnmatched",
        json!({ "assignmentId": assignment_id }),
    );
    assert_eq!(
        unmatched["submissions"].as_array().expect("queue").len(),
        0,
        "flagged submissions leave the manual queue"
    );

    // Still visible in the full queue listing.
    let listing = request_ok(
        &mut stdin,
        &mut reader,
        "l1",
        "submissions.list",
        json!({ "assignmentId": assignment_id }),
    );
    let items = listing["submissions"].as_array().expect("items");
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["status"], "flagged");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
