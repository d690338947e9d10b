use serde_json::json;

use crate::auth::AuthError;
use crate::grading::ReportError;

pub fn ok(id: &str, result: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "ok": true,
        "result": result
    })
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({
        "code": code,
        "message": message.into(),
    });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "ok": false,
        "error": error,
    })
}

pub fn report_err(id: &str, e: &ReportError) -> serde_json::Value {
    let details = match e {
        ReportError::InvalidReference { mark_id, kind } => {
            Some(json!({ "markId": mark_id, "kind": kind }))
        }
        _ => None,
    };
    err(id, e.code(), e.to_string(), details)
}

pub fn auth_err(id: &str, e: &AuthError) -> serde_json::Value {
    err(id, e.code(), e.to_string(), None)
}

/// Maps a `rusqlite` failure to `conflict` when a UNIQUE constraint fired,
/// otherwise to the supplied `db_*` code.
pub fn db_err(id: &str, code: &str, e: rusqlite::Error, table: &str) -> serde_json::Value {
    if let rusqlite::Error::SqliteFailure(f, _) = &e {
        if f.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE {
            return err(
                id,
                "conflict",
                e.to_string(),
                Some(json!({ "table": table })),
            );
        }
    }
    tracing::error!(table, code, error = %e, "database error");
    err(id, code, e.to_string(), Some(json!({ "table": table })))
}
