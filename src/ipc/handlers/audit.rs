use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;

const DEFAULT_LIMIT: i64 = 200;

/// Read the audit trail, newest first, optionally scoped to one entity.
fn handle_audit_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match state.conn(&req.id) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let limit = req
        .params
        .get("limit")
        .and_then(|v| v.as_i64())
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_LIMIT);
    let entity_id = req.str_param("entityId").map(str::to_string);

    let sql = match &entity_id {
        Some(_) => {
            "SELECT seq, ts, actor_id, action, entity_type, entity_id, details_json
             FROM audit_log WHERE entity_id = ? ORDER BY seq DESC LIMIT ?"
        }
        None => {
            "SELECT seq, ts, actor_id, action, entity_type, entity_id, details_json
             FROM audit_log ORDER BY seq DESC LIMIT ?"
        }
    };
    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<serde_json::Value> {
        let details: Option<String> = row.get(6)?;
        Ok(json!({
            "seq": row.get::<_, i64>(0)?,
            "ts": row.get::<_, String>(1)?,
            "actorId": row.get::<_, Option<String>>(2)?,
            "action": row.get::<_, String>(3)?,
            "entityType": row.get::<_, String>(4)?,
            "entityId": row.get::<_, String>(5)?,
            "details": details
                .as_deref()
                .and_then(|d| serde_json::from_str::<serde_json::Value>(d).ok()),
        }))
    };

    let rows = match &entity_id {
        Some(eid) => stmt
            .query_map(rusqlite::params![eid, limit], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
        None => stmt
            .query_map([limit], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>()),
    };

    match rows {
        Ok(entries) => ok(&req.id, json!({ "entries": entries })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "audit.list" => Some(handle_audit_list(state, req)),
        _ => None,
    }
}
