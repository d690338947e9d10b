use crate::api::error::{db_err, err, ok};
use crate::api::helpers::{
    expect_exists, expect_role, optional_f64, optional_str, required_f64, required_str,
};
use crate::api::types::{AppState, Request};
use crate::auth::Role;
use crate::db;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const DEFAULT_TOTAL_POSSIBLE_SCORE: f64 = 100.0;

// Subject and assessment type are LEFT JOINed: marks may outlive them.
const MARK_SELECT: &str = "SELECT
       m.id,
       m.student_id, st.name, st.email,
       m.subject_id, s.name, s.code,
       m.subject_teacher_id, t.name, t.email,
       m.assessment_type_id, at.name,
       m.marks, m.total_possible_score, m.description,
       m.school_id, sc.name,
       m.recorded_at, m.created_at, m.updated_at
     FROM marks m
     LEFT JOIN users st ON st.id = m.student_id
     LEFT JOIN subjects s ON s.id = m.subject_id
     LEFT JOIN users t ON t.id = m.subject_teacher_id
     LEFT JOIN assessment_types at ON at.id = m.assessment_type_id
     LEFT JOIN schools sc ON sc.id = m.school_id";

fn mark_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let subject = match r.get::<_, Option<String>>(5)? {
        Some(name) => json!({
            "id": r.get::<_, String>(4)?,
            "name": name,
            "code": r.get::<_, Option<String>>(6)?,
        }),
        None => json!({ "id": r.get::<_, String>(4)?, "missing": true }),
    };
    let teacher = match r.get::<_, Option<String>>(7)? {
        Some(id) => json!({
            "id": id,
            "name": r.get::<_, Option<String>>(8)?,
            "email": r.get::<_, Option<String>>(9)?,
        }),
        None => serde_json::Value::Null,
    };
    let assessment_type = match r.get::<_, Option<String>>(11)? {
        Some(name) => json!({ "id": r.get::<_, String>(10)?, "name": name }),
        None => json!({ "id": r.get::<_, String>(10)?, "missing": true }),
    };
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "student": {
            "id": r.get::<_, String>(1)?,
            "name": r.get::<_, Option<String>>(2)?,
            "email": r.get::<_, Option<String>>(3)?,
        },
        "subject": subject,
        "subjectTeacher": teacher,
        "assessmentType": assessment_type,
        "marks": r.get::<_, f64>(12)?,
        "totalPossibleScore": r.get::<_, f64>(13)?,
        "marksDescription": r.get::<_, Option<String>>(14)?,
        "school": {
            "id": r.get::<_, String>(15)?,
            "name": r.get::<_, Option<String>>(16)?,
        },
        "recordedAt": r.get::<_, String>(17)?,
        "createdAt": r.get::<_, String>(18)?,
        "updatedAt": r.get::<_, String>(19)?,
    }))
}

fn load_mark(conn: &Connection, id: &str) -> rusqlite::Result<Option<serde_json::Value>> {
    let sql = format!("{} WHERE m.id = ?", MARK_SELECT);
    conn.query_row(&sql, [id], mark_row).optional()
}

fn query_marks(
    conn: &Connection,
    student_id: Option<&str>,
) -> rusqlite::Result<Vec<serde_json::Value>> {
    match student_id {
        Some(sid) => {
            let sql = format!("{} WHERE m.student_id = ? ORDER BY m.rowid", MARK_SELECT);
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([sid], mark_row)?.collect();
            rows
        }
        None => {
            let sql = format!("{} ORDER BY m.rowid", MARK_SELECT);
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], mark_row)?.collect();
            rows
        }
    }
}

fn check_obtained(req: &Request, marks: f64) -> Result<(), serde_json::Value> {
    if marks < 0.0 {
        return Err(err(
            &req.id,
            "bad_params",
            "marks must not be negative",
            Some(json!({ "marks": marks })),
        ));
    }
    Ok(())
}

fn check_total(req: &Request, total: f64) -> Result<(), serde_json::Value> {
    if total <= 0.0 {
        return Err(err(
            &req.id,
            "bad_params",
            "totalPossibleScore must be greater than zero",
            Some(json!({ "totalPossibleScore": total })),
        ));
    }
    Ok(())
}

fn handle_marks_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = &state.db;

    let assessment_type_id = match required_str(req, "assessmentType") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match db::row_exists(conn, "assessment_types", &assessment_type_id) {
        Ok(true) => {}
        Ok(false) => {
            return err(
                &req.id,
                "bad_params",
                "Invalid assessment type",
                Some(json!({ "id": assessment_type_id })),
            )
        }
        Err(e) => return db_err(&req.id, "db_query_failed", e, "assessment_types"),
    }
    let student_id = match required_str(req, "student") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = expect_role(conn, req, &student_id, Role::Student, "student") {
        return e;
    }
    let subject_id = match required_str(req, "subject") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = expect_exists(conn, req, "subjects", &subject_id, "subject") {
        return e;
    }
    let subject_teacher_id = match optional_str(req, "subjectTeacher") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Some(tid) = subject_teacher_id.as_deref() {
        if let Err(e) = expect_role(conn, req, tid, Role::Teacher, "subject teacher") {
            return e;
        }
    }
    let school_id = match required_str(req, "school") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = expect_exists(conn, req, "schools", &school_id, "school") {
        return e;
    }

    let marks = match required_f64(req, "marks") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Err(e) = check_obtained(req, marks) {
        return e;
    }
    let total = match optional_f64(req, "totalPossibleScore") {
        Ok(v) => v.unwrap_or(DEFAULT_TOTAL_POSSIBLE_SCORE),
        Err(e) => return e,
    };
    if let Err(e) = check_total(req, total) {
        return e;
    }
    let description = match optional_str(req, "marksDescription") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let mark_id = Uuid::new_v4().to_string();
    let now = db::now_rfc3339();
    if let Err(e) = conn.execute(
        "INSERT INTO marks(
            id, student_id, subject_id, subject_teacher_id, assessment_type_id,
            marks, total_possible_score, description, school_id,
            recorded_at, created_at, updated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &mark_id,
            &student_id,
            &subject_id,
            &subject_teacher_id,
            &assessment_type_id,
            marks,
            total,
            &description,
            &school_id,
            &now,
            &now,
            &now,
        ),
    ) {
        return db_err(&req.id, "db_insert_failed", e, "marks");
    }

    tracing::info!(mark = %mark_id, student = %student_id, "recorded mark");
    match load_mark(conn, &mark_id) {
        Ok(mark) => ok(&req.id, json!({ "message": "Marks created successfully", "marks": mark })),
        Err(e) => db_err(&req.id, "db_query_failed", e, "marks"),
    }
}

fn handle_marks_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    match query_marks(&state.db, None) {
        Ok(marks) if marks.is_empty() => err(&req.id, "not_found", "No marks found", None),
        Ok(marks) => ok(&req.id, json!({ "marks": marks })),
        Err(e) => db_err(&req.id, "db_query_failed", e, "marks"),
    }
}

fn handle_marks_for_student(state: &mut AppState, req: &Request) -> serde_json::Value {
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match query_marks(&state.db, Some(&student_id)) {
        Ok(marks) => ok(&req.id, json!({ "marks": marks })),
        Err(e) => db_err(&req.id, "db_query_failed", e, "marks"),
    }
}

fn handle_marks_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = &state.db;
    let id = match required_str(req, "id") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let marks = match optional_f64(req, "marks") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Some(m) = marks {
        if let Err(e) = check_obtained(req, m) {
            return e;
        }
    }
    let total = match optional_f64(req, "totalPossibleScore") {
        Ok(v) => v,
        Err(e) => return e,
    };
    if let Some(t) = total {
        if let Err(e) = check_total(req, t) {
            return e;
        }
    }
    let description = match optional_str(req, "marksDescription") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let changed = match conn.execute(
        "UPDATE marks SET
           marks = COALESCE(?, marks),
           total_possible_score = COALESCE(?, total_possible_score),
           description = COALESCE(?, description),
           updated_at = ?
         WHERE id = ?",
        (marks, total, &description, db::now_rfc3339(), &id),
    ) {
        Ok(n) => n,
        Err(e) => return db_err(&req.id, "db_update_failed", e, "marks"),
    };
    if changed == 0 {
        return err(&req.id, "not_found", "Marks not found", None);
    }

    tracing::info!(mark = %id, "updated mark");
    match load_mark(conn, &id) {
        Ok(mark) => ok(&req.id, json!({ "message": "Marks updated successfully", "marks": mark })),
        Err(e) => db_err(&req.id, "db_query_failed", e, "marks"),
    }
}

fn handle_marks_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let id = match required_str(req, "id") {
        Ok(v) => v,
        Err(e) => return e,
    };
    match state.db.execute("DELETE FROM marks WHERE id = ?", [&id]) {
        Ok(0) => err(&req.id, "not_found", "Marks not found", None),
        Ok(_) => {
            tracing::info!(mark = %id, "deleted mark");
            ok(&req.id, json!({ "message": "Marks deleted successfully", "markId": id }))
        }
        Err(e) => db_err(&req.id, "db_delete_failed", e, "marks"),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "marks.create" => Some(handle_marks_create(state, req)),
        "marks.list" => Some(handle_marks_list(state, req)),
        "marks.forStudent" => Some(handle_marks_for_student(state, req)),
        "marks.update" => Some(handle_marks_update(state, req)),
        "marks.delete" => Some(handle_marks_delete(state, req)),
        _ => None,
    }
}
