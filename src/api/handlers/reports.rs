use crate::api::error::{err, ok, report_err};
use crate::api::helpers::{optional_f64, optional_str, required_str};
use crate::api::types::{AppState, Request};
use crate::auth::Role;
use crate::db;
use crate::grading::{self, ReportError};
use serde_json::json;

fn handle_reports_generate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = &state.db;

    // A missing id is reported the same way as an unknown one.
    let student_id = match optional_str(req, "studentId") {
        Ok(Some(v)) => v,
        Ok(None) => return report_err(&req.id, &ReportError::InvalidStudent),
        Err(e) => return e,
    };
    match db::find_user_role(conn, &student_id) {
        Ok(Some(Role::Student)) => {}
        Ok(_) => {
            tracing::info!(student = %student_id, "report requested for non-student");
            return report_err(&req.id, &ReportError::InvalidStudent);
        }
        Err(e) => return report_err(&req.id, &ReportError::storage("db_query_failed", e)),
    }

    let academic_year = match required_str(req, "academicYear") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let attendance = match optional_f64(req, "attendance") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let behavior = match optional_str(req, "behavior") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let records = match db::fetch_mark_records(conn, &student_id) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(student = %student_id, error = %e, "could not load marks");
            return report_err(&req.id, &e);
        }
    };
    let report = match grading::build_report(
        &student_id,
        &academic_year,
        &records,
        attendance,
        behavior,
    ) {
        Ok(r) => r,
        Err(e) => return report_err(&req.id, &e),
    };
    if let Err(e) = db::insert_report(conn, &report) {
        tracing::error!(student = %student_id, error = %e, "could not store report");
        return report_err(&req.id, &e);
    }

    tracing::info!(
        report = %report.id,
        student = %student_id,
        marks = records.len(),
        grade = report.overall_grade.as_str(),
        "generated report"
    );
    match serde_json::to_value(&report) {
        Ok(v) => ok(&req.id, json!({ "message": "Report generated successfully", "report": v })),
        Err(e) => err(&req.id, "internal", e.to_string(), None),
    }
}

fn handle_reports_for_student(state: &mut AppState, req: &Request) -> serde_json::Value {
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let reports = match db::list_reports_for_student(&state.db, &student_id) {
        Ok(r) => r,
        Err(e) => return report_err(&req.id, &e),
    };
    match serde_json::to_value(&reports) {
        Ok(v) => ok(&req.id, json!({ "reports": v })),
        Err(e) => err(&req.id, "internal", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.generate" => Some(handle_reports_generate(state, req)),
        "reports.forStudent" => Some(handle_reports_for_student(state, req)),
        _ => None,
    }
}
