use crate::api::error::{auth_err, db_err, err, ok};
use crate::api::helpers::{
    expect_exists, is_valid_email, optional_str, parse_date, required_str,
};
use crate::api::types::{AppState, Request};
use crate::auth::{self, Role};
use crate::db;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

pub const MIN_PASSWORD_LEN: usize = 6;

const USER_SELECT: &str = "SELECT
       u.id, u.name, u.email, u.role, u.date_of_birth, u.phone_number, u.address,
       u.school_id, s.name, u.class_id, c.name, u.created_at, u.updated_at
     FROM users u
     LEFT JOIN schools s ON s.id = u.school_id
     LEFT JOIN classes c ON c.id = u.class_id";

fn user_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let school_id: String = row.get(7)?;
    let school_name: Option<String> = row.get(8)?;
    let class_id: Option<String> = row.get(9)?;
    let class_name: Option<String> = row.get(10)?;
    Ok(json!({
        "id": row.get::<_, String>(0)?,
        "name": row.get::<_, String>(1)?,
        "email": row.get::<_, String>(2)?,
        "role": row.get::<_, String>(3)?,
        "dateOfBirth": row.get::<_, Option<String>>(4)?,
        "phoneNumber": row.get::<_, Option<String>>(5)?,
        "address": row.get::<_, Option<String>>(6)?,
        "school": { "id": school_id, "name": school_name },
        "class": class_id.map(|id| json!({ "id": id, "name": class_name })),
        "createdAt": row.get::<_, String>(11)?,
        "updatedAt": row.get::<_, String>(12)?,
    }))
}

/// Public view of a user; never includes the password hash.
pub fn load_user(conn: &Connection, id: &str) -> rusqlite::Result<Option<serde_json::Value>> {
    let sql = format!("{} WHERE u.id = ?", USER_SELECT);
    conn.query_row(&sql, [id], user_row).optional()
}

fn parse_role(req: &Request, key: &str) -> Result<Option<Role>, serde_json::Value> {
    match optional_str(req, key)? {
        None => Ok(None),
        Some(r) => Role::parse(&r).map(Some).ok_or_else(|| {
            err(
                &req.id,
                "bad_params",
                "Role must be either admin, teacher, or student",
                Some(json!({ "role": r })),
            )
        }),
    }
}

fn check_password(req: &Request, password: &str) -> Result<(), serde_json::Value> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(err(
            &req.id,
            "bad_params",
            format!("Password must be at least {} characters", MIN_PASSWORD_LEN),
            None,
        ));
    }
    Ok(())
}

fn check_email(req: &Request, email: &str) -> Result<(), serde_json::Value> {
    if !is_valid_email(email) {
        return Err(err(
            &req.id,
            "bad_params",
            "Please enter a valid email",
            Some(json!({ "email": email })),
        ));
    }
    Ok(())
}

fn email_taken(conn: &Connection, email: &str) -> rusqlite::Result<bool> {
    let found: Option<String> = conn
        .query_row("SELECT id FROM users WHERE email = ?", [email], |r| r.get(0))
        .optional()?;
    Ok(found.is_some())
}

fn handle_users_register(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = &state.db;

    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let email = match required_str(req, "email") {
        Ok(v) => v.to_ascii_lowercase(),
        Err(e) => return e,
    };
    if let Err(e) = check_email(req, &email) {
        return e;
    }
    let password = match req.params.get("password").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing password", None),
    };
    if let Err(e) = check_password(req, &password) {
        return e;
    }
    let role = match parse_role(req, "role") {
        Ok(Some(r)) => r,
        Ok(None) => return err(&req.id, "bad_params", "missing role", None),
        Err(e) => return e,
    };
    let school_id = match required_str(req, "schoolId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let date_of_birth = match parse_date(req, "dateOfBirth") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let phone_number = match optional_str(req, "phoneNumber") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let address = match optional_str(req, "address") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match optional_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Some(cid) = class_id.as_deref() {
        if let Err(e) = expect_exists(conn, req, "classes", cid, "class") {
            return e;
        }
    }

    match db::row_exists(conn, "schools", &school_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "School not found", None),
        Err(e) => return db_err(&req.id, "db_query_failed", e, "schools"),
    }
    match email_taken(conn, &email) {
        Ok(false) => {}
        Ok(true) => return err(&req.id, "conflict", "User already exists", None),
        Err(e) => return db_err(&req.id, "db_query_failed", e, "users"),
    }

    let password_hash = match auth::hash_password(&password) {
        Ok(h) => h,
        Err(e) => return auth_err(&req.id, &e),
    };

    let user_id = Uuid::new_v4().to_string();
    let now = db::now_rfc3339();
    if let Err(e) = conn.execute(
        "INSERT INTO users(
            id, name, email, password_hash, role, date_of_birth, phone_number,
            address, school_id, class_id, created_at, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &user_id,
            &name,
            &email,
            &password_hash,
            role.as_str(),
            &date_of_birth,
            &phone_number,
            &address,
            &school_id,
            &class_id,
            &now,
            &now,
        ),
    ) {
        return db_err(&req.id, "db_insert_failed", e, "users");
    }

    let tokens = match state.tokens.issue_pair(&user_id, role) {
        Ok(t) => t,
        Err(e) => return auth_err(&req.id, &e),
    };
    let user = match load_user(conn, &user_id) {
        Ok(Some(u)) => u,
        Ok(None) => return err(&req.id, "internal", "user vanished after insert", None),
        Err(e) => return db_err(&req.id, "db_query_failed", e, "users"),
    };

    tracing::info!(user = %user_id, role = role.as_str(), "registered user");
    ok(
        &req.id,
        json!({
            "message": "User created successfully",
            "user": user,
            "accessToken": tokens.access_token,
            "refreshToken": tokens.refresh_token,
        }),
    )
}

fn handle_users_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let sql = format!("{} ORDER BY u.name, u.created_at", USER_SELECT);
    let mut stmt = match state.db.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return db_err(&req.id, "db_query_failed", e, "users"),
    };
    let rows = stmt
        .query_map([], user_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(users) => ok(&req.id, json!({ "users": users })),
        Err(e) => db_err(&req.id, "db_query_failed", e, "users"),
    }
}

fn handle_users_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let id = match required_str(req, "id") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match load_user(&state.db, &id) {
        Ok(Some(user)) => ok(&req.id, json!({ "user": user })),
        Ok(None) => err(&req.id, "not_found", "User not found", None),
        Err(e) => db_err(&req.id, "db_query_failed", e, "users"),
    }
}

fn handle_users_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = &state.db;
    let id = match required_str(req, "id") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let current_email: Option<String> = match conn
        .query_row("SELECT email FROM users WHERE id = ?", [&id], |r| r.get(0))
        .optional()
    {
        Ok(v) => v,
        Err(e) => return db_err(&req.id, "db_query_failed", e, "users"),
    };
    let Some(current_email) = current_email else {
        return err(&req.id, "not_found", "User not found", None);
    };

    let name = match optional_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let email = match optional_str(req, "email") {
        Ok(v) => v.map(|s| s.to_ascii_lowercase()),
        Err(e) => return e,
    };
    if let Some(new_email) = email.as_deref() {
        if let Err(e) = check_email(req, new_email) {
            return e;
        }
        if new_email != current_email {
            match email_taken(conn, new_email) {
                Ok(false) => {}
                Ok(true) => return err(&req.id, "conflict", "Email is already in use", None),
                Err(e) => return db_err(&req.id, "db_query_failed", e, "users"),
            }
        }
    }
    let password_hash = match req.params.get("password").and_then(|v| v.as_str()) {
        Some(p) if !p.is_empty() => {
            if let Err(e) = check_password(req, p) {
                return e;
            }
            match auth::hash_password(p) {
                Ok(h) => Some(h),
                Err(e) => return auth_err(&req.id, &e),
            }
        }
        _ => None,
    };
    let role = match parse_role(req, "role") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let date_of_birth = match parse_date(req, "dateOfBirth") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let phone_number = match optional_str(req, "phoneNumber") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let address = match optional_str(req, "address") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_id = match optional_str(req, "classId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Some(cid) = class_id.as_deref() {
        if let Err(e) = expect_exists(conn, req, "classes", cid, "class") {
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

    // Absent fields keep their stored value.
    if let Err(e) = conn.execute(
        "UPDATE users SET
           name = COALESCE(?, name),
           email = COALESCE(?, email),
           password_hash = COALESCE(?, password_hash),
           role = COALESCE(?, role),
           date_of_birth = COALESCE(?, date_of_birth),
           phone_number = COALESCE(?, phone_number),
           address = COALESCE(?, address),
           class_id = COALESCE(?, class_id),
           school_id = COALESCE(?, school_id),
           updated_at = ?
         WHERE id = ?",
        (
            &name,
            &email,
            &password_hash,
            role.map(Role::as_str),
            &date_of_birth,
            &phone_number,
            &address,
            &class_id,
            &school_id,
            db::now_rfc3339(),
            &id,
        ),
    ) {
        return db_err(&req.id, "db_update_failed", e, "users");
    }

    match load_user(conn, &id) {
        Ok(Some(user)) => {
            tracing::info!(user = %id, "updated user");
            ok(&req.id, json!({ "message": "User updated successfully", "user": user }))
        }
        Ok(None) => err(&req.id, "not_found", "User not found", None),
        Err(e) => db_err(&req.id, "db_query_failed", e, "users"),
    }
}

fn handle_users_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = &state.db;
    let id = match required_str(req, "id") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let user = match load_user(conn, &id) {
        Ok(Some(u)) => u,
        Ok(None) => return err(&req.id, "not_found", "User not found", None),
        Err(e) => return db_err(&req.id, "db_query_failed", e, "users"),
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Explicitly detach and delete dependents (no ON DELETE CASCADE).
    let steps: [(&str, &str); 10] = [
        ("class_students", "DELETE FROM class_students WHERE user_id = ?"),
        (
            "class_subject_teachers",
            "DELETE FROM class_subject_teachers WHERE user_id = ?",
        ),
        ("subject_teachers", "DELETE FROM subject_teachers WHERE user_id = ?"),
        (
            "classes",
            "UPDATE classes SET class_teacher_id = NULL WHERE class_teacher_id = ?",
        ),
        (
            "classes",
            "UPDATE classes SET male_leader_id = NULL WHERE male_leader_id = ?",
        ),
        (
            "classes",
            "UPDATE classes SET female_leader_id = NULL WHERE female_leader_id = ?",
        ),
        (
            "marks",
            "UPDATE marks SET subject_teacher_id = NULL WHERE subject_teacher_id = ?",
        ),
        ("marks", "DELETE FROM marks WHERE student_id = ?"),
        ("reports", "DELETE FROM reports WHERE student_id = ?"),
        ("users", "DELETE FROM users WHERE id = ?"),
    ];
    for (table, sql) in steps {
        if let Err(e) = tx.execute(sql, [&id]) {
            let _ = tx.rollback();
            return db_err(&req.id, "db_delete_failed", e, table);
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    tracing::info!(user = %id, "deleted user");
    ok(&req.id, json!({ "message": "User deleted successfully", "user": user }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "users.register" => Some(handle_users_register(state, req)),
        "users.list" => Some(handle_users_list(state, req)),
        "users.get" => Some(handle_users_get(state, req)),
        "users.update" => Some(handle_users_update(state, req)),
        "users.delete" => Some(handle_users_delete(state, req)),
        _ => None,
    }
}
