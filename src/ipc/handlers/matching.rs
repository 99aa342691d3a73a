use crate::audit;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;

fn handle_list_unmatched(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match state.conn(&req.id) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let Some(assignment_id) = req.str_param("assignmentId").map(str::to_string) else {
        return err(&req.id, "bad_params", "missing assignmentId", None);
    };

    // Quarantined submissions stay out of the manual queue; they are
    // still visible through submissions.list.
    let mut stmt = match conn.prepare(
        "SELECT id, source_path, content_hash, received_at, notes
         FROM submissions
         WHERE assignment_id = ? AND student_id IS NULL AND status != 'flagged'
         ORDER BY received_at ASC",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&assignment_id], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "sourcePath": row.get::<_, String>(1)?,
                "contentHash": row.get::<_, String>(2)?,
                "receivedAt": row.get::<_, String>(3)?,
                "notes": row.get::<_, Option<String>>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(submissions) => ok(&req.id, json!({ "submissions": submissions })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

/// Assign a student by hand. Idempotent: repeating the call with the
/// same student reaches the same end state; each call audits once.
fn handle_manual_match(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match state.conn(&req.id) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let Some(submission_id) = req.str_param("submissionId").map(str::to_string) else {
        return err(&req.id, "bad_params", "missing submissionId", None);
    };
    let Some(student_id) = req.str_param("studentId").map(str::to_string) else {
        return err(&req.id, "bad_params", "missing studentId", None);
    };

    let sub: Option<(String, Option<String>)> = match conn
        .query_row(
            "SELECT assignment_id, student_id FROM submissions WHERE id = ?",
            [&submission_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((assignment_id, previous)) = sub else {
        return err(&req.id, "not_found", "submission not found", None);
    };

    // The student must be on the roster of the course owning this
    // assignment; matching across courses is always a caller mistake.
    let in_scope: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM students st
             JOIN assignments a ON a.course_id = st.course_id
             WHERE a.id = ? AND st.student_id = ?",
            (&assignment_id, &student_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if in_scope.is_none() {
        return err(
            &req.id,
            "not_found",
            "student not in this assignment's course",
            Some(json!({ "studentId": student_id })),
        );
    }

    if let Err(e) = conn.execute(
        "UPDATE submissions
         SET student_id = ?, match_method = 'manual', match_confidence = 1.0
         WHERE id = ?",
        (&student_id, &submission_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    let _ = audit::record(
        conn,
        req.actor(),
        "submission.manual_match",
        "submission",
        &submission_id,
        Some(json!({ "studentId": student_id, "previousStudentId": previous })),
    );
    ok(&req.id, json!({ "ok": true }))
}

/// Park a submission that cannot be resolved: keeps it visible but out
/// of the active queues. Idempotent end-state.
fn handle_quarantine(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match state.conn(&req.id) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let Some(submission_id) = req.str_param("submissionId").map(str::to_string) else {
        return err(&req.id, "bad_params", "missing submissionId", None);
    };
    let reason = req.str_param("reason").unwrap_or("").to_string();

    let updated = match conn.execute(
        "UPDATE submissions SET status = 'flagged', notes = ? WHERE id = ?",
        (&reason, &submission_id),
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    if updated == 0 {
        return err(&req.id, "not_found", "submission not found", None);
    }

    let _ = audit::record(
        conn,
        req.actor(),
        "submission.quarantine",
        "submission",
        &submission_id,
        Some(json!({ "reason": reason })),
    );
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "submissions.listUnmatched" => Some(handle_list_unmatched(state, req)),
        "submissions.manualMatch" => Some(handle_manual_match(state, req)),
        "submissions.quarantine" => Some(handle_quarantine(state, req)),
        _ => None,
    }
}
