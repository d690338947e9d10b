use crate::api::error::{db_err, err, ok};
use crate::api::helpers::{
    expect_exists, expect_role, optional_id_list, optional_str, required_str,
};
use crate::api::types::{AppState, Request};
use crate::auth::Role;
use crate::db;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const CODE_MIN_LEN: usize = 3;
const CODE_MAX_LEN: usize = 10;

fn load_subject(conn: &Connection, id: &str) -> rusqlite::Result<Option<serde_json::Value>> {
    let base = conn
        .query_row(
            "SELECT s.id, s.name, s.code, s.description, s.school_id, sc.name,
                    s.created_at, s.updated_at
             FROM subjects s
             LEFT JOIN schools sc ON sc.id = s.school_id
             WHERE s.id = ?",
            [id],
            |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "name": r.get::<_, String>(1)?,
                    "code": r.get::<_, String>(2)?,
                    "description": r.get::<_, Option<String>>(3)?,
                    "school": {
                        "id": r.get::<_, String>(4)?,
                        "name": r.get::<_, Option<String>>(5)?,
                    },
                    "createdAt": r.get::<_, String>(6)?,
                    "updatedAt": r.get::<_, String>(7)?,
                }))
            },
        )
        .optional()?;
    let Some(mut subject) = base else {
        return Ok(None);
    };
    let teachers = db::linked_names(
        conn,
        "subject_teachers",
        "subject_id",
        "user_id",
        "users",
        id,
    )?;
    subject["teachers"] = json!(teachers
        .into_iter()
        .map(|(id, name)| json!({ "id": id, "name": name }))
        .collect::<Vec<_>>());
    Ok(Some(subject))
}

fn check_code(req: &Request, code: &str) -> Result<(), serde_json::Value> {
    let len = code.chars().count();
    if !(CODE_MIN_LEN..=CODE_MAX_LEN).contains(&len) {
        return Err(err(
            &req.id,
            "bad_params",
            format!(
                "Subject code must be between {} and {} characters",
                CODE_MIN_LEN, CODE_MAX_LEN
            ),
            Some(json!({ "code": code })),
        ));
    }
    Ok(())
}

fn check_teachers(
    conn: &Connection,
    req: &Request,
    teachers: &[String],
) -> Result<(), serde_json::Value> {
    for teacher_id in teachers {
        expect_role(conn, req, teacher_id, Role::Teacher, "teacher")?;
    }
    Ok(())
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = &state.db;
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let code = match required_str(req, "code") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = check_code(req, &code) {
        return e;
    }
    let description = match optional_str(req, "description") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let teachers = match optional_id_list(req, "teachers") {
        Ok(Some(t)) if !t.is_empty() => t,
        Ok(_) => {
            return err(
                &req.id,
                "bad_params",
                "At least one teacher must be assigned to the subject",
                None,
            )
        }
        Err(e) => return e,
    };
    if let Err(e) = check_teachers(conn, req, &teachers) {
        return e;
    }
    let school_id = match required_str(req, "schoolId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = expect_exists(conn, req, "schools", &school_id, "school") {
        return e;
    }

    let subject_id = Uuid::new_v4().to_string();
    let now = db::now_rfc3339();
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "INSERT INTO subjects(id, name, code, description, school_id, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (&subject_id, &name, &code, &description, &school_id, &now, &now),
    ) {
        let _ = tx.rollback();
        return db_err(&req.id, "db_insert_failed", e, "subjects");
    }
    if let Err(e) = db::replace_links(
        &tx,
        "subject_teachers",
        "subject_id",
        "user_id",
        &subject_id,
        &teachers,
    ) {
        let _ = tx.rollback();
        return db_err(&req.id, "db_insert_failed", e, "subject_teachers");
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    tracing::info!(subject = %subject_id, code = %code, "created subject");
    match load_subject(conn, &subject_id) {
        Ok(subject) => ok(
            &req.id,
            json!({ "message": "Subject created successfully", "subject": subject }),
        ),
        Err(e) => db_err(&req.id, "db_query_failed", e, "subjects"),
    }
}

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = &state.db;
    let mut stmt = match conn.prepare("SELECT id FROM subjects ORDER BY name, code") {
        Ok(s) => s,
        Err(e) => return db_err(&req.id, "db_query_failed", e, "subjects"),
    };
    let ids = match stmt
        .query_map([], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return db_err(&req.id, "db_query_failed", e, "subjects"),
    };
    let mut subjects = Vec::with_capacity(ids.len());
    for id in ids {
        match load_subject(conn, &id) {
            Ok(Some(s)) => subjects.push(s),
            Ok(None) => {}
            Err(e) => return db_err(&req.id, "db_query_failed", e, "subjects"),
        }
    }
    ok(&req.id, json!({ "subjects": subjects }))
}

fn handle_subjects_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let id = match required_str(req, "id") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match load_subject(&state.db, &id) {
        Ok(Some(subject)) => ok(&req.id, json!({ "subject": subject })),
        Ok(None) => err(&req.id, "not_found", "Subject not found", None),
        Err(e) => db_err(&req.id, "db_query_failed", e, "subjects"),
    }
}

fn handle_subjects_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = &state.db;
    let id = match required_str(req, "id") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match db::row_exists(conn, "subjects", &id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "Subject not found", None),
        Err(e) => return db_err(&req.id, "db_query_failed", e, "subjects"),
    }

    let name = match optional_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let code = match optional_str(req, "code") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Some(c) = code.as_deref() {
        if let Err(e) = check_code(req, c) {
            return e;
        }
    }
    let description = match optional_str(req, "description") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let teachers = match optional_id_list(req, "teachers") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Some(t) = teachers.as_deref() {
        if let Err(e) = check_teachers(conn, req, t) {
            return e;
        }
    }
    let school_id = match optional_str(req, "schoolId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Some(sid) = school_id.as_deref() {
        if let Err(e) = expect_exists(conn, req, "schools", sid, "school") {
            return e;
        }
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "UPDATE subjects SET
           name = COALESCE(?, name),
           code = COALESCE(?, code),
           description = COALESCE(?, description),
           school_id = COALESCE(?, school_id),
           updated_at = ?
         WHERE id = ?",
        (
            &name,
            &code,
            &description,
            &school_id,
            db::now_rfc3339(),
            &id,
        ),
    ) {
        let _ = tx.rollback();
        return db_err(&req.id, "db_update_failed", e, "subjects");
    }
    if let Some(t) = teachers.as_deref() {
        if let Err(e) =
            db::replace_links(&tx, "subject_teachers", "subject_id", "user_id", &id, t)
        {
            let _ = tx.rollback();
            return db_err(&req.id, "db_update_failed", e, "subject_teachers");
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    tracing::info!(subject = %id, "updated subject");
    match load_subject(conn, &id) {
        Ok(subject) => ok(
            &req.id,
            json!({ "message": "Subject updated successfully", "subject": subject }),
        ),
        Err(e) => db_err(&req.id, "db_query_failed", e, "subjects"),
    }
}

fn handle_subjects_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = &state.db;
    let id = match required_str(req, "id") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match db::row_exists(conn, "subjects", &id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "Subject not found", None),
        Err(e) => return db_err(&req.id, "db_query_failed", e, "subjects"),
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    // Marks keep their subject reference; reports for those students fail
    // with invalid_reference until the marks are fixed.
    for (table, sql) in [
        ("subject_teachers", "DELETE FROM subject_teachers WHERE subject_id = ?"),
        ("class_subjects", "DELETE FROM class_subjects WHERE subject_id = ?"),
        ("subjects", "DELETE FROM subjects WHERE id = ?"),
    ] {
        if let Err(e) = tx.execute(sql, [&id]) {
            let _ = tx.rollback();
            return db_err(&req.id, "db_delete_failed", e, table);
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    tracing::info!(subject = %id, "deleted subject");
    ok(&req.id, json!({ "message": "Subject deleted successfully", "subjectId": id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "subjects.create" => Some(handle_subjects_create(state, req)),
        "subjects.list" => Some(handle_subjects_list(state, req)),
        "subjects.get" => Some(handle_subjects_get(state, req)),
        "subjects.update" => Some(handle_subjects_update(state, req)),
        "subjects.delete" => Some(handle_subjects_delete(state, req)),
        _ => None,
    }
}
