use crate::api::error::{db_err, err, ok};
use crate::api::helpers::{optional_str, required_str};
use crate::api::types::{AppState, Request};
use crate::db;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn assessment_type_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": row.get::<_, String>(0)?,
        "name": row.get::<_, String>(1)?,
        "description": row.get::<_, Option<String>>(2)?,
        "createdAt": row.get::<_, String>(3)?,
        "updatedAt": row.get::<_, String>(4)?,
    }))
}

fn load_assessment_type(
    conn: &Connection,
    id: &str,
) -> rusqlite::Result<Option<serde_json::Value>> {
    conn.query_row(
        "SELECT id, name, description, created_at, updated_at
         FROM assessment_types WHERE id = ?",
        [id],
        assessment_type_row,
    )
    .optional()
}

fn name_owner(conn: &Connection, name: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT id FROM assessment_types WHERE name = ?",
        [name],
        |r| r.get(0),
    )
    .optional()
}

fn handle_assessment_types_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = &state.db;
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let description = match optional_str(req, "description") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match name_owner(conn, &name) {
        Ok(None) => {}
        Ok(Some(_)) => {
            return err(
                &req.id,
                "conflict",
                "Assessment type already exists",
                Some(json!({ "name": name })),
            )
        }
        Err(e) => return db_err(&req.id, "db_query_failed", e, "assessment_types"),
    }

    let id = Uuid::new_v4().to_string();
    let now = db::now_rfc3339();
    if let Err(e) = conn.execute(
        "INSERT INTO assessment_types(id, name, description, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?)",
        (&id, &name, &description, &now, &now),
    ) {
        return db_err(&req.id, "db_insert_failed", e, "assessment_types");
    }

    tracing::info!(assessment_type = %id, name = %name, "created assessment type");
    match load_assessment_type(conn, &id) {
        Ok(at) => ok(
            &req.id,
            json!({ "message": "Assessment type added successfully", "assessmentType": at }),
        ),
        Err(e) => db_err(&req.id, "db_query_failed", e, "assessment_types"),
    }
}

fn handle_assessment_types_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let mut stmt = match state.db.prepare(
        "SELECT id, name, description, created_at, updated_at
         FROM assessment_types ORDER BY name",
    ) {
        Ok(s) => s,
        Err(e) => return db_err(&req.id, "db_query_failed", e, "assessment_types"),
    };
    match stmt
        .query_map([], assessment_type_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(rows) => ok(&req.id, json!({ "assessmentTypes": rows })),
        Err(e) => db_err(&req.id, "db_query_failed", e, "assessment_types"),
    }
}

fn handle_assessment_types_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = &state.db;
    let id = match required_str(req, "id") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match db::row_exists(conn, "assessment_types", &id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "Assessment type not found", None),
        Err(e) => return db_err(&req.id, "db_query_failed", e, "assessment_types"),
    }
    let name = match optional_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let description = match optional_str(req, "description") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Some(n) = name.as_deref() {
        match name_owner(conn, n) {
            Ok(Some(owner)) if owner != id => {
                return err(
                    &req.id,
                    "conflict",
                    "Assessment type already exists",
                    Some(json!({ "name": n })),
                )
            }
            Ok(_) => {}
            Err(e) => return db_err(&req.id, "db_query_failed", e, "assessment_types"),
        }
    }

    if let Err(e) = conn.execute(
        "UPDATE assessment_types SET
           name = COALESCE(?, name),
           description = COALESCE(?, description),
           updated_at = ?
         WHERE id = ?",
        (&name, &description, db::now_rfc3339(), &id),
    ) {
        return db_err(&req.id, "db_update_failed", e, "assessment_types");
    }

    match load_assessment_type(conn, &id) {
        Ok(at) => ok(
            &req.id,
            json!({ "message": "Assessment type updated successfully", "assessmentType": at }),
        ),
        Err(e) => db_err(&req.id, "db_query_failed", e, "assessment_types"),
    }
}

fn handle_assessment_types_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = &state.db;
    let id = match required_str(req, "id") {
        Ok(v) => v,
        Err(e) => return e,
    };
    // Marks referring to the type are left in place.
    match conn.execute("DELETE FROM assessment_types WHERE id = ?", [&id]) {
        Ok(0) => err(&req.id, "not_found", "Assessment type not found", None),
        Ok(_) => {
            tracing::info!(assessment_type = %id, "deleted assessment type");
            ok(
                &req.id,
                json!({
                    "message": "Assessment type deleted successfully",
                    "assessmentTypeId": id,
                }),
            )
        }
        Err(e) => db_err(&req.id, "db_delete_failed", e, "assessment_types"),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "assessmentTypes.create" => Some(handle_assessment_types_create(state, req)),
        "assessmentTypes.list" => Some(handle_assessment_types_list(state, req)),
        "assessmentTypes.update" => Some(handle_assessment_types_update(state, req)),
        "assessmentTypes.delete" => Some(handle_assessment_types_delete(state, req)),
        _ => None,
    }
}
