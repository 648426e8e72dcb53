use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use super::subs::SubRegistry;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Default)]
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Connection>,
    pub subs: SubRegistry,
}

impl AppState {
    /// Events queued by handlers since the last drain, one JSON line
    /// each, emitted after the triggering response.
    pub fn drain_events(&mut self) -> Vec<serde_json::Value> {
        self.subs.drain_pending()
    }
}
