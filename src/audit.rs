use rusqlite::Connection;

/// Append one audit entry. The table is append-only; nothing in the
/// daemon updates or deletes rows, so the autoincrement seq is a stable
/// total order over all mutations.
pub fn record(
    conn: &Connection,
    actor_id: Option<&str>,
    action: &str,
    entity_type: &str,
    entity_id: &str,
    details: Option<serde_json::Value>,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO audit_log(ts, actor_id, action, entity_type, entity_id, details_json)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            chrono::Utc::now().to_rfc3339(),
            actor_id,
            action,
            entity_type,
            entity_id,
            details.map(|d| d.to_string()),
        ),
    )?;
    Ok(())
}
