use crate::audit;
use crate::error::CoreError;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::rubric::Rubric;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }

    fn db(e: rusqlite::Error) -> HandlerErr {
        HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        }
    }
}

/// (assignment_id, student_id) for a submission, or why grading it is
/// impossible. Grades are keyed on the student, not the submission, so
/// an unresolved submission cannot hold grades yet.
fn grade_key(conn: &Connection, submission_id: &str) -> Result<(String, String), HandlerErr> {
    let row: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT assignment_id, student_id FROM submissions WHERE id = ?",
            [submission_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    let Some((assignment_id, student_id)) = row else {
        return Err(HandlerErr {
            code: "not_found",
            message: "submission not found".to_string(),
            details: None,
        });
    };
    let Some(student_id) = student_id else {
        return Err(HandlerErr {
            code: "bad_params",
            message: "submission has no matched student".to_string(),
            details: None,
        });
    };
    Ok((assignment_id, student_id))
}

fn load_rubric(conn: &Connection, assignment_id: &str) -> Result<Option<Rubric>, HandlerErr> {
    let raw: Option<Option<String>> = conn
        .query_row(
            "SELECT rubric_json FROM assignments WHERE id = ?",
            [assignment_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    match raw.flatten() {
        Some(raw) => Rubric::parse(&raw).map(Some).map_err(|e| HandlerErr {
            code: "invalid_rubric",
            message: e.to_string(),
            details: None,
        }),
        None => Ok(None),
    }
}

/// Re-establish total = Σ score for a non-finalized (assignment,
/// student). Called after every grade mutation, not just on read.
fn recompute_total(
    conn: &Connection,
    assignment_id: &str,
    student_id: &str,
) -> Result<(), HandlerErr> {
    let finalized: Option<bool> = conn
        .query_row(
            "SELECT finalized FROM grade_totals WHERE assignment_id = ? AND student_id = ?",
            (assignment_id, student_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db)?;
    if finalized == Some(true) {
        return Ok(());
    }

    let total: f64 = conn
        .query_row(
            "SELECT COALESCE(SUM(score), 0) FROM grades
             WHERE assignment_id = ? AND student_id = ?",
            (assignment_id, student_id),
            |r| r.get(0),
        )
        .map_err(HandlerErr::db)?;

    conn.execute(
        "INSERT INTO grade_totals(assignment_id, student_id, total_score, finalized)
         VALUES(?, ?, ?, 0)
         ON CONFLICT(assignment_id, student_id) DO UPDATE SET
           total_score = excluded.total_score",
        (assignment_id, student_id, total),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "grade_totals" })),
    })?;
    Ok(())
}

fn save_grade(conn: &Connection, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let submission_id = req.str_param("submissionId").ok_or(HandlerErr {
        code: "bad_params",
        message: "missing submissionId".to_string(),
        details: None,
    })?;
    let question_id = req.str_param("questionId").ok_or(HandlerErr {
        code: "bad_params",
        message: "missing questionId".to_string(),
        details: None,
    })?;
    let score = req.params.get("score").and_then(|v| v.as_f64());
    let comment = req.str_param("comment");
    let presets = req
        .params
        .get("presets")
        .filter(|v| !v.is_null())
        .map(|v| v.to_string());

    let (assignment_id, student_id) = grade_key(conn, submission_id)?;

    let rubric = load_rubric(conn, &assignment_id)?.ok_or(HandlerErr {
        code: "bad_params",
        message: "assignment has no rubric".to_string(),
        details: None,
    })?;
    let question = rubric.question(question_id).ok_or(HandlerErr {
        code: "not_found",
        message: format!("unknown question: {}", question_id),
        details: None,
    })?;

    // Out-of-range scores are rejected outright, never clamped.
    if let Some(s) = score {
        if !s.is_finite() || s < 0.0 || s > question.max_points {
            let core = CoreError::OutOfRangeScore {
                score: s,
                max: question.max_points,
            };
            return Err(HandlerErr {
                code: core.code(),
                message: core.to_string(),
                details: Some(json!({ "questionId": question_id })),
            });
        }
    }

    let previous: Option<Option<f64>> = conn
        .query_row(
            "SELECT score FROM grades
             WHERE assignment_id = ? AND student_id = ? AND question_id = ?",
            (&assignment_id, &student_id, question_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::db)?;

    conn.execute(
        "INSERT INTO grades(
           assignment_id, student_id, question_id, score, comment,
           presets_json, edited_by, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(assignment_id, student_id, question_id) DO UPDATE SET
           score = excluded.score,
           comment = excluded.comment,
           presets_json = excluded.presets_json,
           edited_by = excluded.edited_by,
           updated_at = excluded.updated_at",
        (
            &assignment_id,
            &student_id,
            question_id,
            score,
            comment,
            &presets,
            req.actor(),
            chrono::Utc::now().to_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "grades" })),
    })?;

    recompute_total(conn, &assignment_id, &student_id)?;

    let _ = audit::record(
        conn,
        req.actor(),
        "grade.save",
        "submission",
        submission_id,
        Some(json!({
            "questionId": question_id,
            "score": score,
            "previousScore": previous.flatten(),
            "studentId": student_id,
        })),
    );
    Ok(json!({ "ok": true }))
}

fn handle_grades_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match state.conn(&req.id) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let Some(submission_id) = req.str_param("submissionId").map(str::to_string) else {
        return err(&req.id, "bad_params", "missing submissionId", None);
    };
    let (assignment_id, student_id) = match grade_key(conn, &submission_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let mut stmt = match conn.prepare(
        "SELECT question_id, score, comment, presets_json, edited_by, updated_at
         FROM grades WHERE assignment_id = ? AND student_id = ?
         ORDER BY question_id ASC",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map((&assignment_id, &student_id), |row| {
            let presets: Option<String> = row.get(3)?;
            Ok(json!({
                "questionId": row.get::<_, String>(0)?,
                "score": row.get::<_, Option<f64>>(1)?,
                "comment": row.get::<_, Option<String>>(2)?,
                "presets": presets
                    .as_deref()
                    .and_then(|p| serde_json::from_str::<serde_json::Value>(p).ok()),
                "editedBy": row.get::<_, Option<String>>(4)?,
                "updatedAt": row.get::<_, String>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let grades = match rows {
        Ok(g) => g,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let total = conn
        .query_row(
            "SELECT total_score, finalized FROM grade_totals
             WHERE assignment_id = ? AND student_id = ?",
            (&assignment_id, &student_id),
            |r| {
                Ok(json!({
                    "totalScore": r.get::<_, f64>(0)?,
                    "finalized": r.get::<_, bool>(1)?,
                }))
            },
        )
        .optional()
        .unwrap_or(None);

    ok(&req.id, json!({ "grades": grades, "total": total }))
}

fn handle_grades_save(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match state.conn(&req.id) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    match save_grade(conn, req) {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

fn set_finalized(
    conn: &Connection,
    req: &Request,
    finalize: bool,
) -> Result<serde_json::Value, HandlerErr> {
    let assignment_id = req.str_param("assignmentId").ok_or(HandlerErr {
        code: "bad_params",
        message: "missing assignmentId".to_string(),
        details: None,
    })?;
    let student_id = req.str_param("studentId").ok_or(HandlerErr {
        code: "bad_params",
        message: "missing studentId".to_string(),
        details: None,
    })?;

    if finalize {
        // Freeze whatever the invariant currently says the total is.
        recompute_total(conn, assignment_id, student_id)?;
        conn.execute(
            "INSERT INTO grade_totals(
               assignment_id, student_id, total_score, finalized, finalized_by, finalized_at)
             VALUES(?, ?, 0, 1, ?, ?)
             ON CONFLICT(assignment_id, student_id) DO UPDATE SET
               finalized = 1,
               finalized_by = excluded.finalized_by,
               finalized_at = excluded.finalized_at",
            (
                assignment_id,
                student_id,
                req.actor(),
                chrono::Utc::now().to_rfc3339(),
            ),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: None,
        })?;
    } else {
        conn.execute(
            "UPDATE grade_totals
             SET finalized = 0, finalized_by = NULL, finalized_at = NULL
             WHERE assignment_id = ? AND student_id = ?",
            (assignment_id, student_id),
        )
        .map_err(|e| HandlerErr {
            code: "db_update_failed",
            message: e.to_string(),
            details: None,
        })?;
        // Catch up on any grade edits made while frozen.
        recompute_total(conn, assignment_id, student_id)?;
    }

    let action = if finalize {
        "grade_total.finalize"
    } else {
        "grade_total.unfinalize"
    };
    let _ = audit::record(
        conn,
        req.actor(),
        action,
        "grade_total",
        &format!("{}:{}", assignment_id, student_id),
        None,
    );
    Ok(json!({ "ok": true }))
}

fn handle_finalize(state: &mut AppState, req: &Request, finalize: bool) -> serde_json::Value {
    let conn = match state.conn(&req.id) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    match set_finalized(conn, req, finalize) {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.get" => Some(handle_grades_get(state, req)),
        "grades.save" => Some(handle_grades_save(state, req)),
        "grades.finalize" => Some(handle_finalize(state, req, true)),
        "grades.unfinalize" => Some(handle_finalize(state, req, false)),
        _ => None,
    }
}
