use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::rubric::Rubric;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;

/// Write the gradebook for one assignment as CSV: one row per roster
/// student, total + finalized flag, then score and comment per rubric
/// question. Consumes GradeTotal + Grade + Student; read-only.
fn export_gradebook(
    conn: &Connection,
    assignment_id: &str,
    output_path: &Path,
) -> anyhow::Result<usize> {
    let (course_id, rubric_json): (String, Option<String>) = conn
        .query_row(
            "SELECT course_id, rubric_json FROM assignments WHERE id = ?",
            [assignment_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?
        .ok_or_else(|| anyhow::anyhow!("assignment not found"))?;

    let rubric = match rubric_json.as_deref() {
        Some(raw) => Rubric::parse(raw)?,
        None => Rubric {
            questions: Vec::new(),
        },
    };

    let mut stmt = conn.prepare(
        "SELECT student_id, name, email FROM students WHERE course_id = ? ORDER BY name ASC",
    )?;
    let students: Vec<(String, String, Option<String>)> = stmt
        .query_map([&course_id], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
        .collect::<Result<_, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT student_id, question_id, score, comment
         FROM grades WHERE assignment_id = ?",
    )?;
    let mut grade_map: HashMap<(String, String), (Option<f64>, Option<String>)> = HashMap::new();
    let rows = stmt.query_map([assignment_id], |r| {
        Ok((
            r.get::<_, String>(0)?,
            r.get::<_, String>(1)?,
            r.get::<_, Option<f64>>(2)?,
            r.get::<_, Option<String>>(3)?,
        ))
    })?;
    for row in rows {
        let (student_id, question_id, score, comment) = row?;
        grade_map.insert((student_id, question_id), (score, comment));
    }

    let mut stmt = conn.prepare(
        "SELECT student_id, total_score, finalized FROM grade_totals WHERE assignment_id = ?",
    )?;
    let mut totals: HashMap<String, (f64, bool)> = HashMap::new();
    let rows = stmt.query_map([assignment_id], |r| {
        Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?, r.get::<_, bool>(2)?))
    })?;
    for row in rows {
        let (student_id, total, finalized) = row?;
        totals.insert(student_id, (total, finalized));
    }

    if let Some(parent) = output_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(output_path)?;

    let mut header = vec![
        "Student ID".to_string(),
        "Name".to_string(),
        "Email".to_string(),
        "Total".to_string(),
        "Finalized".to_string(),
    ];
    for q in &rubric.questions {
        header.push(format!("{} ({} pts)", q.title, q.max_points));
        header.push(format!("{} comment", q.title));
    }
    writer.write_record(&header)?;

    let mut count = 0usize;
    for (student_id, name, email) in &students {
        let (total, finalized) = totals
            .get(student_id)
            .copied()
            .unwrap_or((0.0, false));
        let mut record = vec![
            student_id.clone(),
            name.clone(),
            email.clone().unwrap_or_default(),
            format!("{}", total),
            if finalized { "yes" } else { "no" }.to_string(),
        ];
        for q in &rubric.questions {
            let key = (student_id.clone(), q.question_id.clone());
            match grade_map.get(&key) {
                Some((score, comment)) => {
                    record.push(score.map(|s| s.to_string()).unwrap_or_default());
                    record.push(comment.clone().unwrap_or_default());
                }
                None => {
                    record.push(String::new());
                    record.push(String::new());
                }
            }
        }
        writer.write_record(&record)?;
        count += 1;
    }
    writer.flush()?;
    Ok(count)
}

fn handle_gradebook_export(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match state.conn(&req.id) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let Some(assignment_id) = req.str_param("assignmentId").map(str::to_string) else {
        return err(&req.id, "bad_params", "missing assignmentId", None);
    };
    let Some(output_path) = req.str_param("outputPath").map(str::to_string) else {
        return err(&req.id, "bad_params", "missing outputPath", None);
    };

    match export_gradebook(conn, &assignment_id, Path::new(&output_path)) {
        Ok(rows) => {
            tracing::info!(assignment = %assignment_id, rows, path = %output_path, "gradebook exported");
            ok(&req.id, json!({ "rows": rows, "outputPath": output_path }))
        }
        Err(e) => err(&req.id, "export_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "gradebook.export" => Some(handle_gradebook_export(state, req)),
        _ => None,
    }
}
