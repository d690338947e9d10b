use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

use crate::auth::TokenKeys;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
    /// Bearer access token; the HTTP transport fills this from `Authorization`.
    #[serde(default)]
    pub token: Option<String>,
}

pub struct AppState {
    pub workspace: PathBuf,
    pub db: Connection,
    pub tokens: TokenKeys,
}
