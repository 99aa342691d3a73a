use crate::audit;
use crate::db;
use crate::intake;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::resolve;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::path::Path;
use uuid::Uuid;

/// Import a batch of archives for one assignment. Each archive is
/// independent: a bad one reports an error row and the rest proceed.
/// Identity resolution runs synchronously right after each extraction.
fn handle_submissions_import(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(workspace) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let conn = match state.conn(&req.id) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let Some(assignment_id) = req.str_param("assignmentId").map(str::to_string) else {
        return err(&req.id, "bad_params", "missing assignmentId", None);
    };
    let Some(paths) = req.params.get("archivePaths").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing archivePaths", None);
    };

    let course_id: Option<String> = match conn
        .query_row(
            "SELECT course_id FROM assignments WHERE id = ?",
            [&assignment_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(course_id) = course_id else {
        return err(&req.id, "not_found", "assignment not found", None);
    };

    let roster = match load_roster(conn, &course_id) {
        Ok(r) => r,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let fuzzy_threshold = db::settings_get_json(conn, "resolver.fuzzy_threshold")
        .ok()
        .flatten()
        .and_then(|v| v.as_f64())
        .unwrap_or(resolve::DEFAULT_FUZZY_THRESHOLD);

    let cache_root = workspace.join("cache").join(&assignment_id);
    let actor = req.actor();

    let mut results = Vec::new();
    for p in paths {
        let Some(path_str) = p.as_str() else {
            continue;
        };
        let path = Path::new(path_str);
        let filename = path
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| path_str.to_string());

        results.push(import_one(
            conn,
            &assignment_id,
            &roster,
            fuzzy_threshold,
            &cache_root,
            path,
            &filename,
            actor,
        ));
    }

    ok(&req.id, json!({ "results": results }))
}

#[allow(clippy::too_many_arguments)]
fn import_one(
    conn: &Connection,
    assignment_id: &str,
    roster: &[resolve::RosterEntry],
    fuzzy_threshold: f64,
    cache_root: &Path,
    path: &Path,
    filename: &str,
    actor: Option<&str>,
) -> serde_json::Value {
    let hash = match intake::compute_sha256(path) {
        Ok(h) => h,
        Err(e) => {
            return result_row(filename, "error", None, Some(format!("failed to hash: {}", e)))
        }
    };

    // Idempotent re-import: same content for the same assignment is a
    // no-op, reported as such.
    let existing: Option<String> = match conn
        .query_row(
            "SELECT id FROM submissions WHERE assignment_id = ? AND content_hash = ?",
            (assignment_id, &hash),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return result_row(filename, "error", None, Some(e.to_string())),
    };
    if existing.is_some() {
        return result_row(filename, "duplicate", None, None);
    }

    let extraction_dir = cache_root.join(&hash);
    let extraction = match intake::extract_archive(path, &extraction_dir) {
        Ok(x) => x,
        Err(e) => {
            tracing::warn!(archive = %filename, error = %e, "archive rejected");
            return result_row(filename, "error", None, Some(e.to_string()));
        }
    };

    let resolved = resolve::resolve(filename, &extraction.files, roster, fuzzy_threshold);

    let submission_id = Uuid::new_v4().to_string();
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return result_row(filename, "error", None, Some(e.to_string())),
    };

    let (student_id, method, confidence) = match &resolved {
        Some(m) => (Some(m.student_id.as_str()), m.method, m.confidence),
        None => (None, "none", 0.0),
    };

    let inserted = tx.execute(
        "INSERT INTO submissions(
           id, assignment_id, student_id, source_path, content_hash,
           received_at, match_confidence, match_method, status)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, 'unstarted')
         ON CONFLICT(assignment_id, content_hash) DO NOTHING",
        (
            &submission_id,
            assignment_id,
            student_id,
            path.to_string_lossy().to_string(),
            &hash,
            chrono::Utc::now().to_rfc3339(),
            confidence,
            method,
        ),
    );
    match inserted {
        // Lost the uniqueness race to a concurrent import of the same content.
        Ok(0) => {
            let _ = tx.rollback();
            return result_row(filename, "duplicate", None, None);
        }
        Ok(_) => {}
        Err(e) => {
            let _ = tx.rollback();
            return result_row(filename, "error", None, Some(e.to_string()));
        }
    }

    let mut corrupt = 0usize;
    for f in &extraction.files {
        if f.is_corrupt {
            corrupt += 1;
        }
        if let Err(e) = tx.execute(
            "INSERT INTO submission_files(
               id, submission_id, rel_path, cache_path, kind, size_bytes,
               content_hash, is_corrupt, encoding)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                &submission_id,
                &f.rel_path,
                f.cache_path.to_string_lossy().to_string(),
                f.kind.as_str(),
                f.size_bytes as i64,
                &f.content_hash,
                f.is_corrupt,
                f.encoding,
            ),
        ) {
            let _ = tx.rollback();
            return result_row(filename, "error", None, Some(e.to_string()));
        }
    }

    if let Err(e) = tx.commit() {
        return result_row(filename, "error", None, Some(e.to_string()));
    }

    let _ = audit::record(
        conn,
        actor,
        "submission.import",
        "submission",
        &submission_id,
        Some(json!({
            "filename": filename,
            "contentHash": hash,
            "files": extraction.files.len(),
            "corruptFiles": corrupt,
            "skippedEntries": extraction.skipped_entries,
            "matchMethod": method,
            "matchConfidence": confidence,
            "studentId": student_id,
        })),
    );
    tracing::info!(
        submission = %submission_id,
        archive = %filename,
        files = extraction.files.len(),
        matched = student_id.is_some(),
        "submission imported"
    );

    let mut message = None;
    if corrupt > 0 || extraction.skipped_entries > 0 {
        message = Some(format!(
            "{} corrupt file(s), {} skipped entr(ies)",
            corrupt, extraction.skipped_entries
        ));
    }
    result_row(filename, "imported", student_id, message)
}

fn load_roster(conn: &Connection, course_id: &str) -> rusqlite::Result<Vec<resolve::RosterEntry>> {
    let mut stmt =
        conn.prepare("SELECT student_id, name FROM students WHERE course_id = ?")?;
    let rows = stmt.query_map([course_id], |r| {
        Ok(resolve::RosterEntry {
            student_id: r.get(0)?,
            name: r.get(1)?,
        })
    })?;
    rows.collect()
}

fn result_row(
    filename: &str,
    status: &str,
    student_id: Option<&str>,
    message: Option<String>,
) -> serde_json::Value {
    json!({
        "filename": filename,
        "status": status,
        "studentId": student_id,
        "message": message,
    })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "submissions.import" => Some(handle_submissions_import(state, req)),
        _ => None,
    }
}
