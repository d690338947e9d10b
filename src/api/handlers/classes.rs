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

fn named(id: Option<String>, name: Option<String>) -> serde_json::Value {
    match id {
        Some(id) => json!({ "id": id, "name": name }),
        None => serde_json::Value::Null,
    }
}

fn named_list(pairs: Vec<(String, Option<String>)>) -> serde_json::Value {
    json!(pairs
        .into_iter()
        .map(|(id, name)| json!({ "id": id, "name": name }))
        .collect::<Vec<_>>())
}

fn load_class(conn: &Connection, id: &str) -> rusqlite::Result<Option<serde_json::Value>> {
    let base = conn
        .query_row(
            "SELECT c.id, c.name, c.grade,
                    c.class_teacher_id, t.name,
                    c.school_id, s.name,
                    c.male_leader_id, ml.name,
                    c.female_leader_id, fl.name,
                    c.created_at, c.updated_at
             FROM classes c
             LEFT JOIN users t ON t.id = c.class_teacher_id
             LEFT JOIN schools s ON s.id = c.school_id
             LEFT JOIN users ml ON ml.id = c.male_leader_id
             LEFT JOIN users fl ON fl.id = c.female_leader_id
             WHERE c.id = ?",
            [id],
            |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "name": r.get::<_, String>(1)?,
                    "grade": r.get::<_, String>(2)?,
                    "classTeacher": named(r.get(3)?, r.get(4)?),
                    "school": named(r.get(5)?, r.get(6)?),
                    "classLeaders": {
                        "maleLeader": named(r.get(7)?, r.get(8)?),
                        "femaleLeader": named(r.get(9)?, r.get(10)?),
                    },
                    "createdAt": r.get::<_, String>(11)?,
                    "updatedAt": r.get::<_, String>(12)?,
                }))
            },
        )
        .optional()?;
    let Some(mut class) = base else {
        return Ok(None);
    };

    class["subjectTeachers"] = named_list(db::linked_names(
        conn,
        "class_subject_teachers",
        "class_id",
        "user_id",
        "users",
        id,
    )?);
    class["students"] = named_list(db::linked_names(
        conn,
        "class_students",
        "class_id",
        "user_id",
        "users",
        id,
    )?);
    class["subjects"] = named_list(db::linked_names(
        conn,
        "class_subjects",
        "class_id",
        "subject_id",
        "subjects",
        id,
    )?);
    Ok(Some(class))
}

/// Validated membership lists; `None` leaves a stored list untouched.
struct Members {
    subject_teachers: Option<Vec<String>>,
    students: Option<Vec<String>>,
    subjects: Option<Vec<String>>,
}

fn parse_members(conn: &Connection, req: &Request) -> Result<Members, serde_json::Value> {
    let subject_teachers = optional_id_list(req, "subjectTeacherIds")?;
    for id in subject_teachers.iter().flatten() {
        expect_role(conn, req, id, Role::Teacher, "subject teacher")?;
    }
    let students = optional_id_list(req, "students")?;
    for id in students.iter().flatten() {
        expect_role(conn, req, id, Role::Student, "student")?;
    }
    let subjects = optional_id_list(req, "subjects")?;
    for id in subjects.iter().flatten() {
        expect_exists(conn, req, "subjects", id, "subject")?;
    }
    Ok(Members {
        subject_teachers,
        students,
        subjects,
    })
}

fn parse_leader(
    conn: &Connection,
    req: &Request,
    key: &str,
    label: &str,
) -> Result<Option<String>, serde_json::Value> {
    let id = optional_str(req, key)?;
    if let Some(id) = id.as_deref() {
        expect_role(conn, req, id, Role::Student, label)?;
    }
    Ok(id)
}

fn write_members(
    conn: &Connection,
    class_id: &str,
    members: &Members,
) -> Result<(), (&'static str, rusqlite::Error)> {
    let lists: [(&'static str, &'static str, &Option<Vec<String>>); 3] = [
        ("class_subject_teachers", "user_id", &members.subject_teachers),
        ("class_students", "user_id", &members.students),
        ("class_subjects", "subject_id", &members.subjects),
    ];
    for (table, member_col, ids) in lists {
        if let Some(ids) = ids {
            db::replace_links(conn, table, "class_id", member_col, class_id, ids)
                .map_err(|e| (table, e))?;
        }
    }
    Ok(())
}

fn handle_classes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = &state.db;
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let grade = match required_str(req, "grade") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let class_teacher_id = match required_str(req, "classTeacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = expect_role(conn, req, &class_teacher_id, Role::Teacher, "class teacher") {
        return e;
    }
    let mut members = match parse_members(conn, req) {
        Ok(m) => m,
        Err(e) => return e,
    };
    let male_leader_id = match parse_leader(conn, req, "maleLeaderId", "male leader") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let female_leader_id = match parse_leader(conn, req, "femaleLeaderId", "female leader") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let school_id = match required_str(req, "schoolId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = expect_exists(conn, req, "schools", &school_id, "school") {
        return e;
    }

    // A new class always gets its lists written, even when empty.
    members.subject_teachers.get_or_insert_with(Vec::new);
    members.students.get_or_insert_with(Vec::new);
    members.subjects.get_or_insert_with(Vec::new);

    let class_id = Uuid::new_v4().to_string();
    let now = db::now_rfc3339();
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "INSERT INTO classes(
            id, name, grade, class_teacher_id, school_id, male_leader_id,
            female_leader_id, created_at, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &class_id,
            &name,
            &grade,
            &class_teacher_id,
            &school_id,
            &male_leader_id,
            &female_leader_id,
            &now,
            &now,
        ),
    ) {
        let _ = tx.rollback();
        return db_err(&req.id, "db_insert_failed", e, "classes");
    }
    if let Err((table, e)) = write_members(&tx, &class_id, &members) {
        let _ = tx.rollback();
        return db_err(&req.id, "db_insert_failed", e, table);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    tracing::info!(class = %class_id, "created class");
    match load_class(conn, &class_id) {
        Ok(class) => ok(
            &req.id,
            json!({ "message": "Class created successfully", "class": class }),
        ),
        Err(e) => db_err(&req.id, "db_query_failed", e, "classes"),
    }
}

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = &state.db;
    let mut stmt = match conn.prepare("SELECT id FROM classes ORDER BY name") {
        Ok(s) => s,
        Err(e) => return db_err(&req.id, "db_query_failed", e, "classes"),
    };
    let ids = match stmt
        .query_map([], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return db_err(&req.id, "db_query_failed", e, "classes"),
    };
    if ids.is_empty() {
        return err(&req.id, "not_found", "No classes found", None);
    }
    let mut classes = Vec::with_capacity(ids.len());
    for id in ids {
        match load_class(conn, &id) {
            Ok(Some(c)) => classes.push(c),
            Ok(None) => {}
            Err(e) => return db_err(&req.id, "db_query_failed", e, "classes"),
        }
    }
    ok(&req.id, json!({ "classes": classes }))
}

fn handle_classes_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let id = match required_str(req, "id") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match load_class(&state.db, &id) {
        Ok(Some(class)) => ok(&req.id, json!({ "class": class })),
        Ok(None) => err(&req.id, "not_found", "Class not found", None),
        Err(e) => db_err(&req.id, "db_query_failed", e, "classes"),
    }
}

fn handle_classes_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = &state.db;
    let id = match required_str(req, "id") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match db::row_exists(conn, "classes", &id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "Class not found", None),
        Err(e) => return db_err(&req.id, "db_query_failed", e, "classes"),
    }

    let class_teacher_id = match optional_str(req, "classTeacherId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Some(tid) = class_teacher_id.as_deref() {
        if let Err(e) = expect_role(conn, req, tid, Role::Teacher, "class teacher") {
            return e;
        }
    }
    let members = match parse_members(conn, req) {
        Ok(m) => m,
        Err(e) => return e,
    };
    let male_leader_id = match parse_leader(conn, req, "maleLeaderId", "male leader") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let female_leader_id = match parse_leader(conn, req, "femaleLeaderId", "female leader") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let school_id = match optional_str(req, "schoolId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Some(sid) = school_id.as_deref() {
        if let Err(e) = expect_exists(conn, req, "schools", sid, "school") {
            return e;
        }
    }
    let name = match optional_str(req, "name") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let grade = match optional_str(req, "grade") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "UPDATE classes SET
           name = COALESCE(?, name),
           grade = COALESCE(?, grade),
           class_teacher_id = COALESCE(?, class_teacher_id),
           school_id = COALESCE(?, school_id),
           male_leader_id = COALESCE(?, male_leader_id),
           female_leader_id = COALESCE(?, female_leader_id),
           updated_at = ?
         WHERE id = ?",
        (
            &name,
            &grade,
            &class_teacher_id,
            &school_id,
            &male_leader_id,
            &female_leader_id,
            db::now_rfc3339(),
            &id,
        ),
    ) {
        let _ = tx.rollback();
        return db_err(&req.id, "db_update_failed", e, "classes");
    }
    if let Err((table, e)) = write_members(&tx, &id, &members) {
        let _ = tx.rollback();
        return db_err(&req.id, "db_update_failed", e, table);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    tracing::info!(class = %id, "updated class");
    match load_class(conn, &id) {
        Ok(class) => ok(
            &req.id,
            json!({ "message": "Class updated successfully", "class": class }),
        ),
        Err(e) => db_err(&req.id, "db_query_failed", e, "classes"),
    }
}

fn handle_classes_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = &state.db;
    let id = match required_str(req, "id") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match db::row_exists(conn, "classes", &id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "Class not found", None),
        Err(e) => return db_err(&req.id, "db_query_failed", e, "classes"),
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    // Explicitly delete in dependency order (no ON DELETE CASCADE).
    for (table, sql) in [
        ("class_students", "DELETE FROM class_students WHERE class_id = ?"),
        (
            "class_subject_teachers",
            "DELETE FROM class_subject_teachers WHERE class_id = ?",
        ),
        ("class_subjects", "DELETE FROM class_subjects WHERE class_id = ?"),
        ("users", "UPDATE users SET class_id = NULL WHERE class_id = ?"),
        ("classes", "DELETE FROM classes WHERE id = ?"),
    ] {
        if let Err(e) = tx.execute(sql, [&id]) {
            let _ = tx.rollback();
            return db_err(&req.id, "db_delete_failed", e, table);
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    tracing::info!(class = %id, "deleted class");
    ok(&req.id, json!({ "message": "Class deleted successfully", "classId": id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.create" => Some(handle_classes_create(state, req)),
        "classes.list" => Some(handle_classes_list(state, req)),
        "classes.get" => Some(handle_classes_get(state, req)),
        "classes.update" => Some(handle_classes_update(state, req)),
        "classes.delete" => Some(handle_classes_delete(state, req)),
        _ => None,
    }
}
