use chrono::NaiveDate;
use rusqlite::Connection;
use serde_json::json;

use crate::api::error::{db_err, err};
use crate::api::types::Request;
use crate::auth::Role;
use crate::db;

pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    match optional_str(req, key)? {
        Some(v) => Ok(v),
        None => Err(err(&req.id, "bad_params", format!("missing {}", key), None)),
    }
}

/// Absent, null and blank strings all read as `None`.
pub fn optional_str(req: &Request, key: &str) -> Result<Option<String>, serde_json::Value> {
    match req.params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => {
            let t = s.trim();
            Ok(if t.is_empty() { None } else { Some(t.to_string()) })
        }
        Some(other) => Err(err(
            &req.id,
            "bad_params",
            format!("{} must be a string", key),
            Some(json!({ key: other })),
        )),
    }
}

pub fn optional_f64(req: &Request, key: &str) -> Result<Option<f64>, serde_json::Value> {
    match req.params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => match v.as_f64().filter(|x| x.is_finite()) {
            Some(x) => Ok(Some(x)),
            None => Err(err(
                &req.id,
                "bad_params",
                format!("{} must be a number", key),
                Some(json!({ key: v })),
            )),
        },
    }
}

pub fn required_f64(req: &Request, key: &str) -> Result<f64, serde_json::Value> {
    optional_f64(req, key)?
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

pub fn optional_id_list(req: &Request, key: &str) -> Result<Option<Vec<String>>, serde_json::Value> {
    let bad = || {
        err(
            &req.id,
            "bad_params",
            format!("{} must be an array of ids", key),
            None,
        )
    };
    match req.params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Array(items)) => {
            let mut out: Vec<String> = Vec::with_capacity(items.len());
            for item in items {
                let id = item.as_str().map(str::trim).filter(|s| !s.is_empty());
                let Some(id) = id else {
                    return Err(bad());
                };
                if !out.iter().any(|x| x == id) {
                    out.push(id.to_string());
                }
            }
            Ok(Some(out))
        }
        Some(_) => Err(bad()),
    }
}

pub fn is_valid_email(s: &str) -> bool {
    let Some((local, domain)) = s.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !s.chars().any(char::is_whitespace)
}

pub fn parse_date(req: &Request, key: &str) -> Result<Option<String>, serde_json::Value> {
    let Some(raw) = optional_str(req, key)? else {
        return Ok(None);
    };
    match NaiveDate::parse_from_str(&raw, "%Y-%m-%d") {
        Ok(d) => Ok(Some(d.format("%Y-%m-%d").to_string())),
        Err(_) => Err(err(
            &req.id,
            "bad_params",
            format!("{} must be a date (YYYY-MM-DD)", key),
            Some(json!({ key: raw })),
        )),
    }
}

/// Fails with `bad_params` unless `user_id` names a user holding `role`.
pub fn expect_role(
    conn: &Connection,
    req: &Request,
    user_id: &str,
    role: Role,
    label: &str,
) -> Result<(), serde_json::Value> {
    match db::find_user_role(conn, user_id) {
        Ok(Some(r)) if r == role => Ok(()),
        Ok(_) => Err(err(
            &req.id,
            "bad_params",
            format!("Invalid {} ID: {}", label, user_id),
            Some(json!({ "id": user_id, "expectedRole": role.as_str() })),
        )),
        Err(e) => Err(db_err(&req.id, "db_query_failed", e, "users")),
    }
}

/// Fails with `bad_params` unless a row with `id` exists in `table`.
pub fn expect_exists(
    conn: &Connection,
    req: &Request,
    table: &'static str,
    id: &str,
    label: &str,
) -> Result<(), serde_json::Value> {
    match db::row_exists(conn, table, id) {
        Ok(true) => Ok(()),
        Ok(false) => Err(err(
            &req.id,
            "bad_params",
            format!("Invalid {} ID: {}", label, id),
            Some(json!({ "id": id })),
        )),
        Err(e) => Err(db_err(&req.id, "db_query_failed", e, table)),
    }
}
