use crate::audit;
use crate::error::CoreError;
use crate::ipc::error::{err, err_core, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;

pub const STATUSES: [&str; 5] = ["unstarted", "in_progress", "done", "flagged", "error"];

/// Allowed status transitions. `flagged` and `error` are reachable from
/// anywhere; `done` and `flagged` re-enter `in_progress` on re-claim.
fn transition_allowed(from: &str, to: &str) -> bool {
    match to {
        "flagged" | "error" => from != to,
        "in_progress" => matches!(from, "unstarted" | "done" | "flagged"),
        "done" => from == "in_progress",
        _ => false,
    }
}

fn handle_submissions_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match state.conn(&req.id) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let Some(assignment_id) = req.str_param("assignmentId").map(str::to_string) else {
        return err(&req.id, "bad_params", "missing assignmentId", None);
    };

    let mut stmt = match conn.prepare(
        "SELECT
           sub.id,
           sub.student_id,
           st.name,
           sub.status,
           sub.match_method,
           sub.match_confidence,
           sub.claimed_by_ta_id,
           ta.display_name,
           sub.last_opened_at
         FROM submissions sub
         LEFT JOIN assignments a ON a.id = sub.assignment_id
         LEFT JOIN students st
           ON st.student_id = sub.student_id AND st.course_id = a.course_id
         LEFT JOIN tas ta ON ta.id = sub.claimed_by_ta_id
         WHERE sub.assignment_id = ?
         ORDER BY st.name ASC, sub.id ASC",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&assignment_id], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "studentId": row.get::<_, Option<String>>(1)?,
                "studentName": row.get::<_, Option<String>>(2)?,
                "status": row.get::<_, String>(3)?,
                "matchMethod": row.get::<_, String>(4)?,
                "matchConfidence": row.get::<_, f64>(5)?,
                "claimedByTaId": row.get::<_, Option<String>>(6)?,
                "claimedByName": row.get::<_, Option<String>>(7)?,
                "lastOpenedAt": row.get::<_, Option<String>>(8)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(submissions) => ok(&req.id, json!({ "submissions": submissions })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_submissions_detail(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match state.conn(&req.id) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let Some(submission_id) = req.str_param("submissionId").map(str::to_string) else {
        return err(&req.id, "bad_params", "missing submissionId", None);
    };

    let sub = conn
        .query_row(
            "SELECT
               sub.id, sub.assignment_id, sub.student_id, st.name, sub.status,
               sub.match_method, sub.match_confidence, sub.content_hash,
               sub.received_at, sub.claimed_by_ta_id, sub.notes
             FROM submissions sub
             LEFT JOIN assignments a ON a.id = sub.assignment_id
             LEFT JOIN students st
               ON st.student_id = sub.student_id AND st.course_id = a.course_id
             WHERE sub.id = ?",
            [&submission_id],
            |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "assignmentId": r.get::<_, String>(1)?,
                    "studentId": r.get::<_, Option<String>>(2)?,
                    "studentName": r.get::<_, Option<String>>(3)?,
                    "status": r.get::<_, String>(4)?,
                    "matchMethod": r.get::<_, String>(5)?,
                    "matchConfidence": r.get::<_, f64>(6)?,
                    "contentHash": r.get::<_, String>(7)?,
                    "receivedAt": r.get::<_, String>(8)?,
                    "claimedByTaId": r.get::<_, Option<String>>(9)?,
                    "notes": r.get::<_, Option<String>>(10)?,
                }))
            },
        )
        .optional();
    let sub = match sub {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "submission not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut stmt = match conn.prepare(
        "SELECT rel_path, kind, size_bytes, is_corrupt, encoding
         FROM submission_files WHERE submission_id = ? ORDER BY rel_path ASC",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let files = stmt
        .query_map([&submission_id], |row| {
            Ok(json!({
                "path": row.get::<_, String>(0)?,
                "kind": row.get::<_, String>(1)?,
                "sizeBytes": row.get::<_, i64>(2)?,
                "isCorrupt": row.get::<_, bool>(3)?,
                "encoding": row.get::<_, Option<String>>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match files {
        Ok(files) => ok(&req.id, json!({ "submission": sub, "files": files })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

/// Advisory claim: a different prior claimant is overwritten, not an
/// error. Co-review is legitimate; the audit trail carries the overlap.
fn handle_claim(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match state.conn(&req.id) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let Some(submission_id) = req.str_param("submissionId").map(str::to_string) else {
        return err(&req.id, "bad_params", "missing submissionId", None);
    };
    let Some(ta_id) = req.str_param("actorId").map(str::to_string) else {
        return err(&req.id, "bad_params", "missing actorId", None);
    };

    let previous: Option<Option<String>> = match conn
        .query_row(
            "SELECT claimed_by_ta_id FROM submissions WHERE id = ?",
            [&submission_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(previous) = previous else {
        return err(&req.id, "not_found", "submission not found", None);
    };

    let now = chrono::Utc::now().to_rfc3339();
    if let Err(e) = conn.execute(
        "UPDATE submissions
         SET claimed_by_ta_id = ?, claimed_at = ?, last_opened_at = ?
         WHERE id = ?",
        (&ta_id, &now, &now, &submission_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    let overwrote = previous.as_deref().is_some_and(|p| p != ta_id);
    if overwrote {
        tracing::warn!(
            submission = %submission_id,
            previous = previous.as_deref().unwrap_or(""),
            claimant = %ta_id,
            "claim overwrote another grader"
        );
    }
    let _ = audit::record(
        conn,
        Some(&ta_id),
        "submission.claim",
        "submission",
        &submission_id,
        Some(json!({ "previousTaId": previous })),
    );
    ok(&req.id, json!({ "overwrotePrevious": overwrote }))
}

fn handle_release(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match state.conn(&req.id) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let Some(submission_id) = req.str_param("submissionId").map(str::to_string) else {
        return err(&req.id, "bad_params", "missing submissionId", None);
    };

    let updated = match conn.execute(
        "UPDATE submissions SET claimed_by_ta_id = NULL, claimed_at = NULL WHERE id = ?",
        [&submission_id],
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
        "submission.release",
        "submission",
        &submission_id,
        None,
    );
    ok(&req.id, json!({ "ok": true }))
}

/// Keepalive for session resume. Not audited: it carries no decision.
fn handle_touch(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match state.conn(&req.id) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let Some(submission_id) = req.str_param("submissionId").map(str::to_string) else {
        return err(&req.id, "bad_params", "missing submissionId", None);
    };

    let updated = match conn.execute(
        "UPDATE submissions SET last_opened_at = ? WHERE id = ?",
        (chrono::Utc::now().to_rfc3339(), &submission_id),
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    if updated == 0 {
        return err(&req.id, "not_found", "submission not found", None);
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_set_status(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match state.conn(&req.id) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let Some(submission_id) = req.str_param("submissionId").map(str::to_string) else {
        return err(&req.id, "bad_params", "missing submissionId", None);
    };
    let Some(new_status) = req.str_param("status").map(str::to_string) else {
        return err(&req.id, "bad_params", "missing status", None);
    };
    if !STATUSES.contains(&new_status.as_str()) {
        return err(
            &req.id,
            "bad_params",
            format!("unknown status: {}", new_status),
            None,
        );
    }

    let current: Option<String> = match conn
        .query_row(
            "SELECT status FROM submissions WHERE id = ?",
            [&submission_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(current) = current else {
        return err(&req.id, "not_found", "submission not found", None);
    };

    if !transition_allowed(&current, &new_status) {
        return err_core(
            &req.id,
            &CoreError::InvalidTransition {
                from: current,
                to: new_status,
            },
        );
    }

    if let Err(e) = conn.execute(
        "UPDATE submissions SET status = ? WHERE id = ?",
        (&new_status, &submission_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    let _ = audit::record(
        conn,
        req.actor(),
        "submission.status_change",
        "submission",
        &submission_id,
        Some(json!({ "from": current, "to": new_status })),
    );
    ok(&req.id, json!({ "from": current, "to": new_status }))
}

/// Where was this grader last working? Used to restore a session.
fn handle_bookmark(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match state.conn(&req.id) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let Some(assignment_id) = req.str_param("assignmentId").map(str::to_string) else {
        return err(&req.id, "bad_params", "missing assignmentId", None);
    };
    let Some(ta_id) = req.str_param("taId").map(str::to_string) else {
        return err(&req.id, "bad_params", "missing taId", None);
    };

    let last: Option<String> = match conn
        .query_row(
            "SELECT id FROM submissions
             WHERE assignment_id = ? AND claimed_by_ta_id = ? AND status = 'in_progress'
             ORDER BY last_opened_at DESC
             LIMIT 1",
            (&assignment_id, &ta_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(&req.id, json!({ "submissionId": last }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "submissions.list" => Some(handle_submissions_list(state, req)),
        "submissions.detail" => Some(handle_submissions_detail(state, req)),
        "submissions.claim" => Some(handle_claim(state, req)),
        "submissions.release" => Some(handle_release(state, req)),
        "submissions.touch" => Some(handle_touch(state, req)),
        "submissions.setStatus" => Some(handle_set_status(state, req)),
        "submissions.bookmark" => Some(handle_bookmark(state, req)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::transition_allowed;

    #[test]
    fn transition_table() {
        assert!(transition_allowed("unstarted", "in_progress"));
        assert!(transition_allowed("in_progress", "done"));
        assert!(transition_allowed("done", "in_progress"));
        assert!(transition_allowed("flagged", "in_progress"));
        assert!(transition_allowed("unstarted", "flagged"));
        assert!(transition_allowed("done", "error"));

        assert!(!transition_allowed("done", "unstarted"));
        assert!(!transition_allowed("done", "done"));
        assert!(!transition_allowed("error", "in_progress"));
        assert!(!transition_allowed("unstarted", "done"));
    }
}
