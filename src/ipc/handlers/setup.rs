use crate::audit;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::rubric::Rubric;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_courses_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match state.conn(&req.id) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let name = match req.str_param("name") {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => return err(&req.id, "bad_params", "missing name", None),
    };
    let term = req.str_param("term").unwrap_or("").trim().to_string();

    let course_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO courses(id, name, term, created_at) VALUES(?, ?, ?, ?)",
        (&course_id, &name, &term, chrono::Utc::now().to_rfc3339()),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "courses" })),
        );
    }

    ok(&req.id, json!({ "courseId": course_id, "name": name }))
}

fn handle_courses_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "courses": [] }));
    };

    // Include counts so the caller can show a dashboard without N+1 calls.
    let mut stmt = match conn.prepare(
        "SELECT
           c.id,
           c.name,
           c.term,
           (SELECT COUNT(*) FROM students s WHERE s.course_id = c.id) AS student_count,
           (SELECT COUNT(*) FROM assignments a WHERE a.course_id = c.id) AS assignment_count
         FROM courses c
         ORDER BY c.created_at DESC",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "term": row.get::<_, String>(2)?,
                "studentCount": row.get::<_, i64>(3)?,
                "assignmentCount": row.get::<_, i64>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(courses) => ok(&req.id, json!({ "courses": courses })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_courses_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match state.conn(&req.id) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let Some(course_id) = req.str_param("courseId").map(str::to_string) else {
        return err(&req.id, "bad_params", "missing courseId", None);
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM courses WHERE id = ?", [&course_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "course not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Explicitly delete in dependency order (no ON DELETE CASCADE).
    // The audit log is intentionally left alone.
    let steps: [(&str, &str); 8] = [
        (
            "formula_analysis",
            "DELETE FROM formula_analysis WHERE file_id IN (
               SELECT f.id FROM submission_files f
               JOIN submissions s ON s.id = f.submission_id
               JOIN assignments a ON a.id = s.assignment_id
               WHERE a.course_id = ?)",
        ),
        (
            "submission_files",
            "DELETE FROM submission_files WHERE submission_id IN (
               SELECT s.id FROM submissions s
               JOIN assignments a ON a.id = s.assignment_id
               WHERE a.course_id = ?)",
        ),
        (
            "submissions",
            "DELETE FROM submissions WHERE assignment_id IN (
               SELECT id FROM assignments WHERE course_id = ?)",
        ),
        (
            "grades",
            "DELETE FROM grades WHERE assignment_id IN (
               SELECT id FROM assignments WHERE course_id = ?)",
        ),
        (
            "grade_totals",
            "DELETE FROM grade_totals WHERE assignment_id IN (
               SELECT id FROM assignments WHERE course_id = ?)",
        ),
        ("assignments", "DELETE FROM assignments WHERE course_id = ?"),
        ("students", "DELETE FROM students WHERE course_id = ?"),
        ("courses", "DELETE FROM courses WHERE id = ?"),
    ];
    for (table, sql) in steps {
        if let Err(e) = tx.execute(sql, [&course_id]) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": table })),
            );
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    let _ = audit::record(conn, req.actor(), "course.delete", "course", &course_id, None);
    ok(&req.id, json!({ "ok": true }))
}

fn handle_tas_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match state.conn(&req.id) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let Some(display_name) = req.str_param("displayName").map(str::to_string) else {
        return err(&req.id, "bad_params", "missing displayName", None);
    };
    let initials = req.str_param("initials").unwrap_or("").to_string();

    let ta_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO tas(id, display_name, initials) VALUES(?, ?, ?)",
        (&ta_id, &display_name, &initials),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "tas" })),
        );
    }
    ok(&req.id, json!({ "taId": ta_id }))
}

fn handle_tas_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match state.conn(&req.id) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let mut stmt = match conn
        .prepare("SELECT id, display_name, initials FROM tas ORDER BY display_name ASC")
    {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "displayName": row.get::<_, String>(1)?,
                "initials": row.get::<_, String>(2)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(tas) => ok(&req.id, json!({ "tas": tas })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

/// Upsert by (course_id, student_id); re-import replaces, never duplicates.
fn handle_roster_import(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match state.conn(&req.id) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let Some(course_id) = req.str_param("courseId").map(str::to_string) else {
        return err(&req.id, "bad_params", "missing courseId", None);
    };
    let Some(students) = req.params.get("students").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing students", None);
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let mut count = 0usize;
    for s in students {
        let Some(student_id) = s.get("studentId").and_then(|v| v.as_str()) else {
            let _ = tx.rollback();
            return err(&req.id, "bad_params", "student missing studentId", None);
        };
        let Some(name) = s.get("name").and_then(|v| v.as_str()) else {
            let _ = tx.rollback();
            return err(&req.id, "bad_params", "student missing name", None);
        };
        let email = s.get("email").and_then(|v| v.as_str());
        let section = s.get("section").and_then(|v| v.as_str());
        let extra = s.get("extra").map(|v| v.to_string());

        if let Err(e) = tx.execute(
            "INSERT INTO students(course_id, student_id, name, email, section, extra_json)
             VALUES(?, ?, ?, ?, ?, ?)
             ON CONFLICT(course_id, student_id) DO UPDATE SET
               name = excluded.name,
               email = excluded.email,
               section = excluded.section,
               extra_json = excluded.extra_json",
            (&course_id, student_id, name, email, section, extra),
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "students" })),
            );
        }
        count += 1;
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    let _ = audit::record(
        conn,
        req.actor(),
        "roster.import",
        "course",
        &course_id,
        Some(json!({ "count": count })),
    );
    tracing::info!(course = %course_id, count, "roster imported");
    ok(&req.id, json!({ "count": count }))
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match state.conn(&req.id) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let Some(course_id) = req.str_param("courseId").map(str::to_string) else {
        return err(&req.id, "bad_params", "missing courseId", None);
    };
    let mut stmt = match conn.prepare(
        "SELECT student_id, name, email, section FROM students WHERE course_id = ? ORDER BY name ASC",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&course_id], |row| {
            Ok(json!({
                "studentId": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "email": row.get::<_, Option<String>>(2)?,
                "section": row.get::<_, Option<String>>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_assignments_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match state.conn(&req.id) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let Some(course_id) = req.str_param("courseId").map(str::to_string) else {
        return err(&req.id, "bad_params", "missing courseId", None);
    };
    let Some(title) = req.str_param("title").map(str::to_string) else {
        return err(&req.id, "bad_params", "missing title", None);
    };
    let due_date = req.str_param("dueDate").map(str::to_string);

    let course_exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM courses WHERE id = ?", [&course_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if course_exists.is_none() {
        return err(&req.id, "not_found", "course not found", None);
    }

    let assignment_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO assignments(id, course_id, title, due_date, created_at) VALUES(?, ?, ?, ?, ?)",
        (
            &assignment_id,
            &course_id,
            &title,
            &due_date,
            chrono::Utc::now().to_rfc3339(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "assignments" })),
        );
    }
    ok(&req.id, json!({ "assignmentId": assignment_id }))
}

fn handle_assignments_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match state.conn(&req.id) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let Some(course_id) = req.str_param("courseId").map(str::to_string) else {
        return err(&req.id, "bad_params", "missing courseId", None);
    };
    let mut stmt = match conn.prepare(
        "SELECT id, title, due_date, rubric_json IS NOT NULL, created_at
         FROM assignments WHERE course_id = ? ORDER BY created_at DESC",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&course_id], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "title": row.get::<_, String>(1)?,
                "dueDate": row.get::<_, Option<String>>(2)?,
                "hasRubric": row.get::<_, bool>(3)?,
                "createdAt": row.get::<_, String>(4)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(assignments) => ok(&req.id, json!({ "assignments": assignments })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_assignments_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match state.conn(&req.id) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let Some(assignment_id) = req.str_param("assignmentId").map(str::to_string) else {
        return err(&req.id, "bad_params", "missing assignmentId", None);
    };
    let row = conn
        .query_row(
            "SELECT id, course_id, title, due_date, rubric_json, created_at
             FROM assignments WHERE id = ?",
            [&assignment_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, Option<String>>(3)?,
                    r.get::<_, Option<String>>(4)?,
                    r.get::<_, String>(5)?,
                ))
            },
        )
        .optional();
    match row {
        Ok(Some((id, course_id, title, due_date, rubric_json, created_at))) => {
            let rubric = rubric_json
                .as_deref()
                .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok());
            ok(
                &req.id,
                json!({
                    "id": id,
                    "courseId": course_id,
                    "title": title,
                    "dueDate": due_date,
                    "rubric": rubric,
                    "createdAt": created_at,
                }),
            )
        }
        Ok(None) => err(&req.id, "not_found", "assignment not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

/// Validate the rubric as a typed tree before storing; a malformed
/// document is rejected here, not discovered at grading time.
fn handle_rubric_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match state.conn(&req.id) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let Some(assignment_id) = req.str_param("assignmentId").map(str::to_string) else {
        return err(&req.id, "bad_params", "missing assignmentId", None);
    };
    let Some(rubric_value) = req.params.get("rubric") else {
        return err(&req.id, "bad_params", "missing rubric", None);
    };

    let raw = rubric_value.to_string();
    if let Err(e) = Rubric::parse(&raw) {
        return err(&req.id, "invalid_rubric", e.to_string(), None);
    }

    match conn.execute(
        "UPDATE assignments SET rubric_json = ? WHERE id = ?",
        (&raw, &assignment_id),
    ) {
        Ok(0) => err(&req.id, "not_found", "assignment not found", None),
        Ok(_) => {
            let _ = audit::record(
                conn,
                req.actor(),
                "rubric.update",
                "assignment",
                &assignment_id,
                None,
            );
            ok(&req.id, json!({ "ok": true }))
        }
        Err(e) => err(&req.id, "db_update_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "courses.create" => Some(handle_courses_create(state, req)),
        "courses.list" => Some(handle_courses_list(state, req)),
        "courses.delete" => Some(handle_courses_delete(state, req)),
        "tas.create" => Some(handle_tas_create(state, req)),
        "tas.list" => Some(handle_tas_list(state, req)),
        "roster.import" => Some(handle_roster_import(state, req)),
        "students.list" => Some(handle_students_list(state, req)),
        "assignments.create" => Some(handle_assignments_create(state, req)),
        "assignments.list" => Some(handle_assignments_list(state, req)),
        "assignments.get" => Some(handle_assignments_get(state, req)),
        "rubric.update" => Some(handle_rubric_update(state, req)),
        _ => None,
    }
}
