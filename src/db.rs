use crate::auth::Role;
use crate::grading::{AssessmentTypeRef, MarkRecord, ReportError, ReportRecord, SubjectRef};
use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub const DB_FILE_NAME: &str = "schoold.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schools(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            address TEXT NOT NULL,
            phone_number TEXT,
            email TEXT UNIQUE,
            website TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            grade TEXT NOT NULL,
            class_teacher_id TEXT,
            school_id TEXT NOT NULL,
            male_leader_id TEXT,
            female_leader_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            role TEXT NOT NULL CHECK(role IN ('admin', 'teacher', 'student')),
            date_of_birth TEXT,
            phone_number TEXT,
            address TEXT,
            school_id TEXT NOT NULL,
            class_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(school_id) REFERENCES schools(id),
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_users_school ON users(school_id)",
        [],
    )?;

    // Membership lists keep the order they were submitted in.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_students(
            class_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            PRIMARY KEY(class_id, user_id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_subject_teachers(
            class_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            PRIMARY KEY(class_id, user_id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            code TEXT NOT NULL UNIQUE,
            description TEXT,
            school_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS subject_teachers(
            subject_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            PRIMARY KEY(subject_id, user_id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(user_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_subjects(
            class_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            PRIMARY KEY(class_id, subject_id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assessment_types(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            description TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    // subject_id / assessment_type_id are plain references: they are resolved
    // when a report is generated, and a dangling one fails that report.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS marks(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            subject_teacher_id TEXT,
            assessment_type_id TEXT NOT NULL,
            marks REAL NOT NULL,
            total_possible_score REAL NOT NULL DEFAULT 100,
            description TEXT,
            school_id TEXT NOT NULL,
            recorded_at TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES users(id),
            FOREIGN KEY(subject_teacher_id) REFERENCES users(id),
            FOREIGN KEY(school_id) REFERENCES schools(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_marks_student ON marks(student_id)",
        [],
    )?;
    ensure_marks_total_possible_score(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS reports(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            academic_year TEXT NOT NULL,
            subjects_json TEXT NOT NULL,
            cumulative_points REAL NOT NULL,
            attendance REAL,
            behavior TEXT,
            overall_grade TEXT NOT NULL,
            generated_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES users(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_reports_student ON reports(student_id)",
        [],
    )?;

    Ok(conn)
}

// Early workspaces stored marks without a per-assessment total.
fn ensure_marks_total_possible_score(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "marks", "total_possible_score")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE marks ADD COLUMN total_possible_score REAL NOT NULL DEFAULT 100",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// `table` must be one of the schema's table names, never caller input.
pub fn row_exists(conn: &Connection, table: &'static str, id: &str) -> rusqlite::Result<bool> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?", table);
    let found: Option<i64> = conn.query_row(&sql, [id], |r| r.get(0)).optional()?;
    Ok(found.is_some())
}

/// Replaces the ordered link rows of one owner (class members, subject
/// teachers). Identifiers are schema constants.
pub fn replace_links(
    conn: &Connection,
    table: &'static str,
    owner_col: &'static str,
    member_col: &'static str,
    owner_id: &str,
    member_ids: &[String],
) -> rusqlite::Result<()> {
    conn.execute(
        &format!("DELETE FROM {} WHERE {} = ?", table, owner_col),
        [owner_id],
    )?;
    let mut stmt = conn.prepare(&format!(
        "INSERT INTO {}({}, {}, sort_order) VALUES(?, ?, ?)",
        table, owner_col, member_col
    ))?;
    for (i, member_id) in member_ids.iter().enumerate() {
        stmt.execute((owner_id, member_id, i as i64))?;
    }
    Ok(())
}

/// Linked `(id, name)` pairs in stored order. `names_table` holds the names.
pub fn linked_names(
    conn: &Connection,
    table: &'static str,
    owner_col: &'static str,
    member_col: &'static str,
    names_table: &'static str,
    owner_id: &str,
) -> rusqlite::Result<Vec<(String, Option<String>)>> {
    let sql = format!(
        "SELECT l.{member}, n.name
         FROM {table} l
         LEFT JOIN {names} n ON n.id = l.{member}
         WHERE l.{owner} = ?
         ORDER BY l.sort_order",
        member = member_col,
        table = table,
        names = names_table,
        owner = owner_col,
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([owner_id], |r| Ok((r.get(0)?, r.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Role of the user with `id`, if any. Unknown role strings read as absent.
pub fn find_user_role(conn: &Connection, id: &str) -> rusqlite::Result<Option<Role>> {
    let role: Option<String> = conn
        .query_row("SELECT role FROM users WHERE id = ?", [id], |r| r.get(0))
        .optional()?;
    Ok(role.as_deref().and_then(Role::parse))
}

/// Marks of one student in insertion order, with subject and assessment type
/// resolved to their current rows.
pub fn fetch_mark_records(
    conn: &Connection,
    student_id: &str,
) -> Result<Vec<MarkRecord>, ReportError> {
    let mut stmt = conn
        .prepare(
            "SELECT
               m.id,
               m.subject_id,
               s.name,
               s.code,
               m.assessment_type_id,
               at.name,
               m.marks,
               m.total_possible_score,
               m.description
             FROM marks m
             LEFT JOIN subjects s ON s.id = m.subject_id
             LEFT JOIN assessment_types at ON at.id = m.assessment_type_id
             WHERE m.student_id = ?
             ORDER BY m.rowid",
        )
        .map_err(|e| ReportError::storage("db_query_failed", e))?;

    struct Row {
        mark_id: String,
        subject_id: String,
        subject_name: Option<String>,
        subject_code: Option<String>,
        assessment_type_id: String,
        assessment_type_name: Option<String>,
        marks: f64,
        total: f64,
        description: Option<String>,
    }

    let rows = stmt
        .query_map([student_id], |r| {
            Ok(Row {
                mark_id: r.get(0)?,
                subject_id: r.get(1)?,
                subject_name: r.get(2)?,
                subject_code: r.get(3)?,
                assessment_type_id: r.get(4)?,
                assessment_type_name: r.get(5)?,
                marks: r.get(6)?,
                total: r.get(7)?,
                description: r.get(8)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| ReportError::storage("db_query_failed", e))?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let (Some(subject_name), Some(subject_code)) = (row.subject_name, row.subject_code) else {
            return Err(ReportError::InvalidReference {
                mark_id: row.mark_id,
                kind: "subject",
            });
        };
        let Some(assessment_type_name) = row.assessment_type_name else {
            return Err(ReportError::InvalidReference {
                mark_id: row.mark_id,
                kind: "assessment type",
            });
        };
        out.push(MarkRecord {
            student_id: student_id.to_string(),
            subject: SubjectRef {
                id: row.subject_id,
                name: subject_name,
                code: subject_code,
            },
            assessment_type: AssessmentTypeRef {
                id: row.assessment_type_id,
                name: assessment_type_name,
            },
            obtained_score: row.marks,
            total_possible_score: row.total,
            description: row.description,
        });
    }
    Ok(out)
}

pub fn insert_report(conn: &Connection, report: &ReportRecord) -> Result<(), ReportError> {
    let subjects_json = serde_json::to_string(&report.subjects).map_err(|e| {
        ReportError::storage(
            "db_insert_failed",
            rusqlite::Error::ToSqlConversionFailure(Box::new(e)),
        )
    })?;
    conn.execute(
        "INSERT INTO reports(
            id, student_id, academic_year, subjects_json, cumulative_points,
            attendance, behavior, overall_grade, generated_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &report.id,
            &report.student_id,
            &report.academic_year,
            &subjects_json,
            report.cumulative_points,
            report.attendance,
            &report.behavior,
            report.overall_grade.as_str(),
            report
                .generated_at
                .to_rfc3339_opts(SecondsFormat::Millis, true),
        ),
    )
    .map_err(|e| ReportError::storage("db_insert_failed", e))?;
    Ok(())
}

pub fn list_reports_for_student(
    conn: &Connection,
    student_id: &str,
) -> Result<Vec<ReportRecord>, ReportError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, academic_year, subjects_json, cumulative_points, attendance,
                    behavior, overall_grade, generated_at
             FROM reports
             WHERE student_id = ?
             ORDER BY generated_at, rowid",
        )
        .map_err(|e| ReportError::storage("db_query_failed", e))?;

    let rows = stmt
        .query_map([student_id], |r| {
            let subjects_json: String = r.get(2)?;
            let subjects = serde_json::from_str(&subjects_json).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
            })?;
            let grade: String = r.get(6)?;
            let overall_grade = crate::grading::Letter::parse(&grade).ok_or_else(|| {
                rusqlite::Error::FromSqlConversionFailure(
                    6,
                    rusqlite::types::Type::Text,
                    format!("unknown grade {grade}").into(),
                )
            })?;
            let generated_at: String = r.get(7)?;
            let generated_at = chrono::DateTime::parse_from_rfc3339(&generated_at)
                .map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        7,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })?
                .with_timezone(&Utc);
            Ok(ReportRecord {
                id: r.get(0)?,
                student_id: student_id.to_string(),
                academic_year: r.get(1)?,
                subjects,
                cumulative_points: r.get(3)?,
                attendance: r.get(4)?,
                behavior: r.get(5)?,
                overall_grade,
                generated_at,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| ReportError::storage("db_query_failed", e))?;
    Ok(rows)
}
