use crate::api::error::{db_err, err, ok};
use crate::api::helpers::{is_valid_email, optional_str, required_str};
use crate::api::types::{AppState, Request};
use crate::db;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const SCHOOL_SELECT: &str = "SELECT id, name, address, phone_number, email, website, created_at, updated_at
     FROM schools";

fn school_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": row.get::<_, String>(0)?,
        "name": row.get::<_, String>(1)?,
        "address": row.get::<_, String>(2)?,
        "phoneNumber": row.get::<_, Option<String>>(3)?,
        "email": row.get::<_, Option<String>>(4)?,
        "website": row.get::<_, Option<String>>(5)?,
        "createdAt": row.get::<_, String>(6)?,
        "updatedAt": row.get::<_, String>(7)?,
    }))
}

fn load_school(conn: &Connection, id: &str) -> rusqlite::Result<Option<serde_json::Value>> {
    let sql = format!("{} WHERE id = ?", SCHOOL_SELECT);
    conn.query_row(&sql, [id], school_row).optional()
}

fn email_owner(conn: &Connection, email: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row("SELECT id FROM schools WHERE email = ?", [email], |r| {
        r.get(0)
    })
    .optional()
}

fn handle_schools_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let sql = format!("{} ORDER BY name", SCHOOL_SELECT);
    let mut stmt = match state.db.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return db_err(&req.id, "db_query_failed", e, "schools"),
    };
    let rows = stmt
        .query_map([], school_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(schools) if schools.is_empty() => err(&req.id, "not_found", "No schools found", None),
        Ok(schools) => ok(
            &req.id,
            json!({ "message": "Schools retrieved successfully", "schools": schools }),
        ),
        Err(e) => db_err(&req.id, "db_query_failed", e, "schools"),
    }
}

fn handle_schools_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let id = match required_str(req, "id") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match load_school(&state.db, &id) {
        Ok(Some(school)) => ok(
            &req.id,
            json!({ "message": "School retrieved successfully", "school": school }),
        ),
        Ok(None) => err(&req.id, "not_found", "School not found", None),
        Err(e) => db_err(&req.id, "db_query_failed", e, "schools"),
    }
}

fn handle_schools_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = &state.db;
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let address = match required_str(req, "address") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let phone_number = match required_str(req, "phoneNumber") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let email = match required_str(req, "email") {
        Ok(v) => v.to_ascii_lowercase(),
        Err(e) => return e,
    };
    if !is_valid_email(&email) {
        return err(
            &req.id,
            "bad_params",
            "Please enter a valid email address",
            Some(json!({ "email": email })),
        );
    }
    let website = match optional_str(req, "website") {
        Ok(v) => v,
        Err(e) => return e,
    };

    match email_owner(conn, &email) {
        Ok(None) => {}
        Ok(Some(_)) => {
            return err(
                &req.id,
                "conflict",
                "A school with this email already exists",
                None,
            )
        }
        Err(e) => return db_err(&req.id, "db_query_failed", e, "schools"),
    }

    let school_id = Uuid::new_v4().to_string();
    let now = db::now_rfc3339();
    if let Err(e) = conn.execute(
        "INSERT INTO schools(id, name, address, phone_number, email, website, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &school_id,
            &name,
            &address,
            &phone_number,
            &email,
            &website,
            &now,
            &now,
        ),
    ) {
        return db_err(&req.id, "db_insert_failed", e, "schools");
    }

    tracing::info!(school = %school_id, "created school");
    match load_school(conn, &school_id) {
        Ok(school) => ok(
            &req.id,
            json!({ "message": "School created successfully", "school": school }),
        ),
        Err(e) => db_err(&req.id, "db_query_failed", e, "schools"),
    }
}

fn handle_schools_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = &state.db;
    let id = match required_str(req, "id") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match db::row_exists(conn, "schools", &id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "School not found", None),
        Err(e) => return db_err(&req.id, "db_query_failed", e, "schools"),
    }

    let name = match optional_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let address = match optional_str(req, "address") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let phone_number = match optional_str(req, "phoneNumber") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let email = match optional_str(req, "email") {
        Ok(v) => v.map(|e| e.to_ascii_lowercase()),
        Err(e) => return e,
    };
    let website = match optional_str(req, "website") {
        Ok(v) => v,
        Err(e) => return e,
    };

    if let Some(new_email) = email.as_deref() {
        if !is_valid_email(new_email) {
            return err(
                &req.id,
                "bad_params",
                "Please enter a valid email address",
                Some(json!({ "email": new_email })),
            );
        }
        match email_owner(conn, new_email) {
            Ok(Some(owner)) if owner != id => {
                return err(
                    &req.id,
                    "conflict",
                    "A school with this email already exists",
                    None,
                )
            }
            Ok(_) => {}
            Err(e) => return db_err(&req.id, "db_query_failed", e, "schools"),
        }
    }

    if let Err(e) = conn.execute(
        "UPDATE schools SET
           name = COALESCE(?, name),
           address = COALESCE(?, address),
           phone_number = COALESCE(?, phone_number),
           email = COALESCE(?, email),
           website = COALESCE(?, website),
           updated_at = ?
         WHERE id = ?",
        (
            &name,
            &address,
            &phone_number,
            &email,
            &website,
            db::now_rfc3339(),
            &id,
        ),
    ) {
        return db_err(&req.id, "db_update_failed", e, "schools");
    }

    tracing::info!(school = %id, "updated school");
    match load_school(conn, &id) {
        Ok(school) => ok(
            &req.id,
            json!({ "message": "School updated successfully", "school": school }),
        ),
        Err(e) => db_err(&req.id, "db_query_failed", e, "schools"),
    }
}

fn handle_schools_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = &state.db;
    let id = match required_str(req, "id") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match db::row_exists(conn, "schools", &id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "School not found", None),
        Err(e) => return db_err(&req.id, "db_query_failed", e, "schools"),
    }

    // Schools own users, classes, subjects and marks; refuse while any remain.
    let dependents = conn.query_row(
        "SELECT
           (SELECT COUNT(*) FROM users WHERE school_id = ?1),
           (SELECT COUNT(*) FROM classes WHERE school_id = ?1),
           (SELECT COUNT(*) FROM subjects WHERE school_id = ?1),
           (SELECT COUNT(*) FROM marks WHERE school_id = ?1)",
        [&id],
        |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, i64>(2)?,
                r.get::<_, i64>(3)?,
            ))
        },
    );
    match dependents {
        Ok((0, 0, 0, 0)) => {}
        Ok((users, classes, subjects, marks)) => {
            return err(
                &req.id,
                "conflict",
                "School still has dependent records",
                Some(json!({
                    "users": users,
                    "classes": classes,
                    "subjects": subjects,
                    "marks": marks,
                })),
            )
        }
        Err(e) => return db_err(&req.id, "db_query_failed", e, "schools"),
    }

    if let Err(e) = conn.execute("DELETE FROM schools WHERE id = ?", [&id]) {
        return db_err(&req.id, "db_delete_failed", e, "schools");
    }
    tracing::info!(school = %id, "deleted school");
    ok(&req.id, json!({ "message": "School deleted successfully", "schoolId": id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "schools.list" => Some(handle_schools_list(state, req)),
        "schools.get" => Some(handle_schools_get(state, req)),
        "schools.create" => Some(handle_schools_create(state, req)),
        "schools.update" => Some(handle_schools_update(state, req)),
        "schools.delete" => Some(handle_schools_delete(state, req)),
        _ => None,
    }
}
