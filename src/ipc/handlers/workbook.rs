use crate::intake;
use crate::ipc::error::{err, err_core, ok};
use crate::ipc::types::{AppState, Request};
use crate::rubric::RangeCheck;
use crate::workbook;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::path::{Path, PathBuf};

struct FileRow {
    id: String,
    cache_path: PathBuf,
    kind: String,
    is_corrupt: bool,
}

fn lookup_file(
    conn: &Connection,
    req: &Request,
) -> Result<FileRow, (String, String)> {
    let Some(submission_id) = req.str_param("submissionId") else {
        return Err(("bad_params".into(), "missing submissionId".into()));
    };
    let Some(file_path) = req.str_param("filePath") else {
        return Err(("bad_params".into(), "missing filePath".into()));
    };

    let row = conn
        .query_row(
            "SELECT id, cache_path, kind, is_corrupt
             FROM submission_files WHERE submission_id = ? AND rel_path = ?",
            (submission_id, file_path),
            |r| {
                Ok(FileRow {
                    id: r.get(0)?,
                    cache_path: PathBuf::from(r.get::<_, String>(1)?),
                    kind: r.get(2)?,
                    is_corrupt: r.get(3)?,
                })
            },
        )
        .optional()
        .map_err(|e| ("db_query_failed".to_string(), e.to_string()))?;

    let Some(row) = row else {
        return Err(("not_found".into(), "file not found in submission".into()));
    };
    if row.kind != "spreadsheet" {
        return Err((
            "bad_params".into(),
            format!("not a spreadsheet file: kind={}", row.kind),
        ));
    }
    if row.is_corrupt {
        return Err(("bad_params".into(), "file was marked corrupt at intake".into()));
    }
    Ok(row)
}

fn handle_analyze(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match state.conn(&req.id) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let file = match lookup_file(conn, req) {
        Ok(f) => f,
        Err((code, msg)) => return err(&req.id, &code, msg, None),
    };
    match workbook::analyze(&file.cache_path) {
        Ok(a) => ok(
            &req.id,
            serde_json::to_value(&a).unwrap_or_else(|_| json!({})),
        ),
        Err(e) => err_core(&req.id, &e),
    }
}

/// Full map, served from the formula_analysis cache when the file's
/// content hash still matches. A recompute replaces the row wholesale.
fn cached_formula_map(
    conn: &Connection,
    file: &FileRow,
) -> Result<workbook::WorkbookMap, crate::error::CoreError> {
    let current_hash = intake::compute_sha256(&file.cache_path).unwrap_or_default();

    let cached: Option<(String, String)> = conn
        .query_row(
            "SELECT content_hash, summary_json FROM formula_analysis WHERE file_id = ?",
            [&file.id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .unwrap_or(None);
    if let Some((hash, summary)) = cached {
        if hash == current_hash {
            if let Ok(map) = serde_json::from_str::<workbook::WorkbookMap>(&summary) {
                return Ok(map);
            }
            // Unreadable cache rows are recomputed below.
        }
    }

    let map = workbook::formula_map(&file.cache_path)?;

    let summary = serde_json::to_string(&map).unwrap_or_else(|_| "{}".to_string());
    let _ = conn.execute(
        "INSERT INTO formula_analysis(file_id, content_hash, analyzed_at, summary_json)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(file_id) DO UPDATE SET
           content_hash = excluded.content_hash,
           analyzed_at = excluded.analyzed_at,
           summary_json = excluded.summary_json",
        (
            &file.id,
            &current_hash,
            chrono::Utc::now().to_rfc3339(),
            &summary,
        ),
    );
    tracing::info!(file = %file.id, hash = %current_hash, "formula map computed");
    Ok(map)
}

fn handle_formula_map(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match state.conn(&req.id) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let file = match lookup_file(conn, req) {
        Ok(f) => f,
        Err((code, msg)) => return err(&req.id, &code, msg, None),
    };
    match cached_formula_map(conn, &file) {
        Ok(map) => ok(
            &req.id,
            serde_json::to_value(&map).unwrap_or_else(|_| json!({})),
        ),
        Err(e) => err_core(&req.id, &e),
    }
}

fn handle_run_checks(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match state.conn(&req.id) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let file = match lookup_file(conn, req) {
        Ok(f) => f,
        Err((code, msg)) => return err(&req.id, &code, msg, None),
    };
    let Some(raw_checks) = req.params.get("checks") else {
        return err(&req.id, "bad_params", "missing checks", None);
    };
    let checks: Vec<RangeCheck> = match serde_json::from_value(raw_checks.clone()) {
        Ok(c) => c,
        Err(e) => return err(&req.id, "bad_params", format!("invalid checks: {}", e), None),
    };
    for c in &checks {
        if let Err(e) = c.validate() {
            return err(&req.id, "bad_params", format!("invalid check: {}", e), None);
        }
    }

    let map = match cached_formula_map(conn, &file) {
        Ok(m) => m,
        Err(e) => return err_core(&req.id, &e),
    };
    let results = workbook::run_checks(&map, &checks);
    ok(
        &req.id,
        json!({
            "results": results
                .iter()
                .map(|r| json!({ "pass": r.pass, "detail": r.detail }))
                .collect::<Vec<_>>()
        }),
    )
}

/// Best-effort preview; failures are reported but grading never depends
/// on this succeeding.
fn handle_render_preview(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match state.conn(&req.id) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let file = match lookup_file(conn, req) {
        Ok(f) => f,
        Err((code, msg)) => return err(&req.id, &code, msg, None),
    };
    match workbook::render_preview(&file.cache_path) {
        Ok(pdf_name) => {
            let pdf_path = file
                .cache_path
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join(&pdf_name);
            ok(
                &req.id,
                json!({ "pdfPath": pdf_path.to_string_lossy() }),
            )
        }
        Err(e) => err(&req.id, "preview_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "workbook.analyze" => Some(handle_analyze(state, req)),
        "workbook.formulaMap" => Some(handle_formula_map(state, req)),
        "workbook.runChecks" => Some(handle_run_checks(state, req)),
        "workbook.renderPreview" => Some(handle_render_preview(state, req)),
        _ => None,
    }
}
