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

struct Fixture {
    workspace: PathBuf,
    assignment_id: String,
    submission_id: String,
}

fn setup(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> Fixture {
    let workspace = temp_dir("gradehub-grades");
    request_ok(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let course = request_ok(
        stdin,
        reader,
        "c1",
        "courses.create",
        json!({ "name": "Spreadsheets 101", "term": "F26" }),
    );
    let course_id = course["courseId"].as_str().expect("courseId").to_string();
    request_ok(
        stdin,
        reader,
        "r1",
        "roster.import",
        json!({
            "courseId": course_id,
            "students": [{ "studentId": "S10293", "name": "Doe, Jane", "email": "jane@example.edu" }]
        }),
    );
    let assignment = request_ok(
        stdin,
        reader,
        "a1",
        "assignments.create",
        json!({ "courseId": course_id, "title": "HW1" }),
    );
    let assignment_id = assignment["assignmentId"].as_str().expect("id").to_string();

    request_ok(
        stdin,
        reader,
        "ru1",
        "rubric.update",
        json!({
            "assignmentId": assignment_id,
            "rubric": {
                "questions": [
                    {
                        "question_id": "q1",
                        "title": "Model",
                        "max_points": 10.0,
                        "comment_presets": [
                            { "label": "off-by-one", "text": "Range is off by one row", "deduction": 1.0 }
                        ],
                        "checks": []
                    },
                    { "question_id": "q2", "title": "Chart", "max_points": 5.0 }
                ]
            }
        }),
    );

    let archive = workspace.join("S10293_hw1.zip");
    write_zip(&archive, &[("work.txt", b"graded content".as_slice())]);
    let res = request_ok(
        stdin,
        reader,
        "i1",
        "submissions.import",
        json!({ "assignmentId": assignment_id, "archivePaths": [archive.to_string_lossy()] }),
    );
    assert_eq!(res["results"][0]["studentId"], "S10293");

    let conn = Connection::open(workspace.join("gradehub.sqlite3")).expect("open db");
    let submission_id: String = conn
        .query_row("SELECT id FROM submissions", [], |r| r.get(0))
        .expect("submission row");

    Fixture {
        workspace,
        assignment_id,
        submission_id,
    }
}

fn total_row(conn: &Connection, assignment_id: &str) -> (f64, bool) {
    conn.query_row(
        "SELECT total_score, finalized FROM grade_totals
         WHERE assignment_id = ? AND student_id = 'S10293'",
        [assignment_id],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )
    .expect("total row")
}

#[test]
fn totals_track_grade_rows_until_finalized() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let fx = setup(&mut stdin, &mut reader);
    let conn = Connection::open(fx.workspace.join("gradehub.sqlite3")).expect("open db");

    request_ok(
        &mut stdin,
        &mut reader,
        "g1",
        "grades.save",
        json!({
            "submissionId": fx.submission_id,
            "questionId": "q1",
            "score": 7.0,
            "comment": "solid",
            "actorId": "ta-1"
        }),
    );
    assert_eq!(total_row(&conn, &fx.assignment_id), (7.0, false));

    request_ok(
        &mut stdin,
        &mut reader,
        "g2",
        "grades.save",
        json!({
            "submissionId": fx.submission_id,
            "questionId": "q2",
            "score": 4.0,
            "actorId": "ta-1"
        }),
    );
    assert_eq!(total_row(&conn, &fx.assignment_id), (11.0, false));

    // Out of range: rejected, no partial write, total unchanged.
    let bad = request(
        &mut stdin,
        &mut reader,
        "g3",
        "grades.save",
        json!({
            "submissionId": fx.submission_id,
            "questionId": "q1",
            "score": 11.0,
            "actorId": "ta-1"
        }),
    );
    assert_eq!(bad["ok"], false);
    assert_eq!(bad["error"]["code"], "out_of_range_score");
    let q1_score: f64 = conn
        .query_row(
            "SELECT score FROM grades WHERE assignment_id = ? AND question_id = 'q1'",
            [&fx.assignment_id],
            |r| r.get(0),
        )
        .expect("q1 score");
    assert_eq!(q1_score, 7.0, "rejected save must not alter the row");
    assert_eq!(total_row(&conn, &fx.assignment_id), (11.0, false));

    // Unknown question ids are refused at the boundary.
    let unknown = request(
        &mut stdin,
        &mut reader,
        "g4",
        "grades.save",
        json!({
            "submissionId": fx.submission_id,
            "questionId": "q9",
            "score": 1.0,
            "actorId": "ta-1"
        }),
    );
    assert_eq!(unknown["ok"], false);
    assert_eq!(unknown["error"]["code"], "not_found");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(fx.workspace);
}

#[test]
fn finalize_freezes_the_total_until_thawed() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let fx = setup(&mut stdin, &mut reader);
    let conn = Connection::open(fx.workspace.join("gradehub.sqlite3")).expect("open db");

    request_ok(
        &mut stdin,
        &mut reader,
        "g1",
        "grades.save",
        json!({
            "submissionId": fx.submission_id,
            "questionId": "q1",
            "score": 7.0,
            "actorId": "ta-1"
        }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "g2",
        "grades.save",
        json!({
            "submissionId": fx.submission_id,
            "questionId": "q2",
            "score": 4.0,
            "actorId": "ta-1"
        }),
    );

    request_ok(
        &mut stdin,
        &mut reader,
        "f1",
        "grades.finalize",
        json!({
            "assignmentId": fx.assignment_id,
            "studentId": "S10293",
            "actorId": "ta-lead"
        }),
    );
    assert_eq!(total_row(&conn, &fx.assignment_id), (11.0, true));

    // Individual rows still update; the frozen total does not move.
    request_ok(
        &mut stdin,
        &mut reader,
        "g3",
        "grades.save",
        json!({
            "submissionId": fx.submission_id,
            "questionId": "q1",
            "score": 5.0,
            "actorId": "ta-1"
        }),
    );
    let q1_score: f64 = conn
        .query_row(
            "SELECT score FROM grades WHERE assignment_id = ? AND question_id = 'q1'",
            [&fx.assignment_id],
            |r| r.get(0),
        )
        .expect("q1 score");
    assert_eq!(q1_score, 5.0);
    assert_eq!(total_row(&conn, &fx.assignment_id), (11.0, true));

    // Thaw: the invariant is re-established immediately.
    request_ok(
        &mut stdin,
        &mut reader,
        "f2",
        "grades.unfinalize",
        json!({
            "assignmentId": fx.assignment_id,
            "studentId": "S10293",
            "actorId": "ta-lead"
        }),
    );
    assert_eq!(total_row(&conn, &fx.assignment_id), (9.0, false));

    // Export consumes totals + grades + roster.
    let out = fx.workspace.join("exports").join("hw1.csv");
    let exported = request_ok(
        &mut stdin,
        &mut reader,
        "e1",
        "gradebook.export",
        json!({
            "assignmentId": fx.assignment_id,
            "outputPath": out.to_string_lossy()
        }),
    );
    assert_eq!(exported["rows"], 1);
    let csv_text = std::fs::read_to_string(&out).expect("read csv");
    let mut lines = csv_text.lines();
    let header = lines.next().expect("header");
    assert!(header.starts_with("Student ID,Name,Email,Total,Finalized"));
    assert!(header.contains("Model (10 pts)"));
    let row = lines.next().expect("data row");
    assert!(row.starts_with("S10293,"));
    assert!(row.contains(",9,"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(fx.workspace);
}
