use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl Request {
    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }

    /// Actor id for audited mutations; absent for tooling-driven calls.
    pub fn actor(&self) -> Option<&str> {
        self.str_param("actorId")
    }
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
}

impl AppState {
    /// Connection or the standard no-workspace refusal.
    pub fn conn(&self, req_id: &str) -> Result<&Connection, serde_json::Value> {
        self.db.as_ref().ok_or_else(|| {
            super::error::err(req_id, "no_workspace", "select a workspace first", None)
        })
    }
}
