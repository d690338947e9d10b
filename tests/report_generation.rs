use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar(workspace: &Path) -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_schoold");
    let mut child = Command::new(exe)
        .arg("--stdio")
        .arg("--workspace")
        .arg(workspace)
        .env("ACCESS_TOKEN_SECRET", "test-access-secret")
        .env("REFRESH_TOKEN_SECRET", "test-refresh-secret")
        .env("SCHOOLD_LOG", "warn")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn schoold");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
    token: Option<&str>,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
        "token": token,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
    token: Option<&str>,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params, token);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

struct Seed {
    school_id: String,
    teacher_id: String,
    student_id: String,
    token: String,
}

fn seed(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> Seed {
    let school = request_ok(
        stdin,
        reader,
        "seed-school",
        "schools.create",
        json!({
            "name": "Hillside Secondary",
            "address": "12 Hill Road",
            "phoneNumber": "+254700000000",
            "email": "office@hillside.example",
        }),
        None,
    );
    let school_id = school["school"]["id"].as_str().expect("school id").to_string();

    let teacher = request_ok(
        stdin,
        reader,
        "seed-teacher",
        "users.register",
        json!({
            "name": "Grace Hopper",
            "email": "grace@hillside.example",
            "password": "compilers",
            "role": "teacher",
            "schoolId": school_id,
        }),
        None,
    );
    let teacher_id = teacher["user"]["id"].as_str().expect("teacher id").to_string();

    let student = request_ok(
        stdin,
        reader,
        "seed-student",
        "users.register",
        json!({
            "name": "Ada Lovelace",
            "email": "ada@hillside.example",
            "password": "engines",
            "role": "student",
            "schoolId": school_id,
        }),
        None,
    );
    let student_id = student["user"]["id"].as_str().expect("student id").to_string();

    let login = request_ok(
        stdin,
        reader,
        "seed-login",
        "auth.login",
        json!({ "email": "grace@hillside.example", "password": "compilers" }),
        None,
    );
    let token = login["accessToken"].as_str().expect("access token").to_string();

    Seed {
        school_id,
        teacher_id,
        student_id,
        token,
    }
}

fn create_subject(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    seed: &Seed,
    name: &str,
    code: &str,
) -> String {
    let res = request_ok(
        stdin,
        reader,
        &format!("subject-{}", code),
        "subjects.create",
        json!({
            "name": name,
            "code": code,
            "teachers": [seed.teacher_id],
            "schoolId": seed.school_id,
        }),
        Some(&seed.token),
    );
    res["subject"]["id"].as_str().expect("subject id").to_string()
}

fn create_assessment_type(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    seed: &Seed,
    name: &str,
) -> String {
    let res = request_ok(
        stdin,
        reader,
        &format!("at-{}", name),
        "assessmentTypes.create",
        json!({ "name": name }),
        Some(&seed.token),
    );
    res["assessmentType"]["id"]
        .as_str()
        .expect("assessment type id")
        .to_string()
}

#[allow(clippy::too_many_arguments)]
fn record_mark(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    seed: &Seed,
    id: &str,
    subject_id: &str,
    assessment_type_id: &str,
    marks: f64,
    total: Option<f64>,
) -> String {
    let mut params = json!({
        "student": seed.student_id,
        "subject": subject_id,
        "subjectTeacher": seed.teacher_id,
        "assessmentType": assessment_type_id,
        "marks": marks,
        "school": seed.school_id,
    });
    if let Some(t) = total {
        params["totalPossibleScore"] = json!(t);
    }
    let res = request_ok(stdin, reader, id, "marks.create", params, Some(&seed.token));
    assert_eq!(res["message"], "Marks created successfully");
    res["marks"]["id"].as_str().expect("mark id").to_string()
}

#[test]
fn report_groups_marks_by_subject_and_grades_them() {
    let workspace = temp_dir("schoold-report-groups");
    let (mut child, mut stdin, mut reader) = spawn_sidecar(&workspace);
    let seed = seed(&mut stdin, &mut reader);

    let math = create_subject(&mut stdin, &mut reader, &seed, "Mathematics", "MAT101");
    let english = create_subject(&mut stdin, &mut reader, &seed, "English", "ENG101");
    let midterm = create_assessment_type(&mut stdin, &mut reader, &seed, "Midterm");
    let final_exam = create_assessment_type(&mut stdin, &mut reader, &seed, "Final");

    record_mark(&mut stdin, &mut reader, &seed, "m1", &math, &midterm, 95.0, None);
    record_mark(&mut stdin, &mut reader, &seed, "m2", &english, &midterm, 85.0, None);
    record_mark(&mut stdin, &mut reader, &seed, "m3", &math, &final_exam, 36.0, Some(40.0));

    let res = request_ok(
        &mut stdin,
        &mut reader,
        "gen",
        "reports.generate",
        json!({
            "studentId": seed.student_id,
            "academicYear": "2024",
            "attendance": 96.5,
            "behavior": "Attentive",
        }),
        Some(&seed.token),
    );
    assert_eq!(res["message"], "Report generated successfully");
    let report = &res["report"];
    assert_eq!(report["studentId"], seed.student_id.as_str());
    assert_eq!(report["academicYear"], "2024");
    assert_eq!(report["attendance"], 96.5);
    assert_eq!(report["behavior"], "Attentive");

    let subjects = report["subjects"].as_array().expect("subjects");
    assert_eq!(subjects.len(), 2);
    assert_eq!(subjects[0]["subject"]["code"], "MAT101");
    assert_eq!(subjects[1]["subject"]["code"], "ENG101");

    let math_entries = subjects[0]["assessments"].as_array().expect("math entries");
    assert_eq!(math_entries.len(), 2);
    assert_eq!(math_entries[0]["assessmentType"]["name"], "Midterm");
    assert_eq!(math_entries[0]["grade"], "A");
    // 36 of 40 is graded against its own total.
    assert_eq!(math_entries[1]["grade"], "A");
    assert_eq!(math_entries[1]["totalPossibleScore"], 40.0);
    assert_eq!(subjects[1]["assessments"][0]["grade"], "B");

    // 216 of 3 * 100.
    assert_eq!(report["cumulativePoints"], 216.0);
    assert_eq!(report["overallGrade"], "C");

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn marks_summing_past_f64_range_still_grade() {
    let workspace = temp_dir("schoold-report-huge");
    let (mut child, mut stdin, mut reader) = spawn_sidecar(&workspace);
    let seed = seed(&mut stdin, &mut reader);

    let math = create_subject(&mut stdin, &mut reader, &seed, "Mathematics", "MAT101");
    let midterm = create_assessment_type(&mut stdin, &mut reader, &seed, "Midterm");
    record_mark(&mut stdin, &mut reader, &seed, "m1", &math, &midterm, 1e308, None);
    record_mark(&mut stdin, &mut reader, &seed, "m2", &math, &midterm, 1e308, None);

    let res = request_ok(
        &mut stdin,
        &mut reader,
        "gen",
        "reports.generate",
        json!({ "studentId": seed.student_id, "academicYear": "2024" }),
        Some(&seed.token),
    );
    assert_eq!(res["report"]["overallGrade"], "A");
    assert_eq!(res["report"]["subjects"][0]["assessments"][1]["grade"], "A");

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn each_generation_stores_a_new_report() {
    let workspace = temp_dir("schoold-report-twice");
    let (mut child, mut stdin, mut reader) = spawn_sidecar(&workspace);
    let seed = seed(&mut stdin, &mut reader);

    let math = create_subject(&mut stdin, &mut reader, &seed, "Mathematics", "MAT101");
    let english = create_subject(&mut stdin, &mut reader, &seed, "English", "ENG101");
    let midterm = create_assessment_type(&mut stdin, &mut reader, &seed, "Midterm");
    record_mark(&mut stdin, &mut reader, &seed, "m1", &math, &midterm, 95.0, None);
    record_mark(&mut stdin, &mut reader, &seed, "m2", &english, &midterm, 85.0, None);

    let params = json!({ "studentId": seed.student_id, "academicYear": "2024" });
    let first = request_ok(
        &mut stdin,
        &mut reader,
        "gen-1",
        "reports.generate",
        params.clone(),
        Some(&seed.token),
    );
    let second = request_ok(
        &mut stdin,
        &mut reader,
        "gen-2",
        "reports.generate",
        params,
        Some(&seed.token),
    );
    assert_ne!(first["report"]["id"], second["report"]["id"]);
    assert_eq!(first["report"]["cumulativePoints"], 180.0);
    assert_eq!(first["report"]["overallGrade"], "A");
    assert_eq!(first["report"]["subjects"], second["report"]["subjects"]);

    let stored = request_ok(
        &mut stdin,
        &mut reader,
        "list",
        "reports.forStudent",
        json!({ "studentId": seed.student_id }),
        Some(&seed.token),
    );
    let reports = stored["reports"].as_array().expect("reports");
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0]["id"], first["report"]["id"]);
    assert_eq!(reports[1]["id"], second["report"]["id"]);

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn report_rejects_students_without_marks_and_non_students() {
    let workspace = temp_dir("schoold-report-rejects");
    let (mut child, mut stdin, mut reader) = spawn_sidecar(&workspace);
    let seed = seed(&mut stdin, &mut reader);

    let no_marks = request(
        &mut stdin,
        &mut reader,
        "nodata",
        "reports.generate",
        json!({ "studentId": seed.student_id, "academicYear": "2024" }),
        Some(&seed.token),
    );
    assert_eq!(error_code(&no_marks), "no_data");
    assert_eq!(no_marks["error"]["message"], "student lacks any marks data");

    let teacher = request(
        &mut stdin,
        &mut reader,
        "teacher",
        "reports.generate",
        json!({ "studentId": seed.teacher_id, "academicYear": "2024" }),
        Some(&seed.token),
    );
    assert_eq!(error_code(&teacher), "invalid_student");

    let unknown = request(
        &mut stdin,
        &mut reader,
        "unknown",
        "reports.generate",
        json!({ "studentId": "no-such-user", "academicYear": "2024" }),
        Some(&seed.token),
    );
    assert_eq!(error_code(&unknown), "invalid_student");

    let missing = request(
        &mut stdin,
        &mut reader,
        "missing",
        "reports.generate",
        json!({ "academicYear": "2024" }),
        Some(&seed.token),
    );
    assert_eq!(error_code(&missing), "invalid_student");

    // Nothing was written by the failed attempts.
    let stored = request_ok(
        &mut stdin,
        &mut reader,
        "list",
        "reports.forStudent",
        json!({ "studentId": seed.student_id }),
        Some(&seed.token),
    );
    assert_eq!(stored["reports"].as_array().map(Vec::len), Some(0));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn report_fails_when_a_mark_points_at_a_deleted_subject() {
    let workspace = temp_dir("schoold-report-dangling");
    let (mut child, mut stdin, mut reader) = spawn_sidecar(&workspace);
    let seed = seed(&mut stdin, &mut reader);

    let math = create_subject(&mut stdin, &mut reader, &seed, "Mathematics", "MAT101");
    let history = create_subject(&mut stdin, &mut reader, &seed, "History", "HIS201");
    let midterm = create_assessment_type(&mut stdin, &mut reader, &seed, "Midterm");
    record_mark(&mut stdin, &mut reader, &seed, "m1", &math, &midterm, 70.0, None);
    let dangling = record_mark(&mut stdin, &mut reader, &seed, "m2", &history, &midterm, 60.0, None);

    request_ok(
        &mut stdin,
        &mut reader,
        "del",
        "subjects.delete",
        json!({ "id": history }),
        Some(&seed.token),
    );

    let res = request(
        &mut stdin,
        &mut reader,
        "gen",
        "reports.generate",
        json!({ "studentId": seed.student_id, "academicYear": "2024" }),
        Some(&seed.token),
    );
    assert_eq!(error_code(&res), "invalid_reference");
    assert_eq!(res["error"]["details"]["markId"], dangling.as_str());
    assert_eq!(res["error"]["details"]["kind"], "subject");

    // Removing the orphaned mark makes the student reportable again.
    request_ok(
        &mut stdin,
        &mut reader,
        "del-mark",
        "marks.delete",
        json!({ "id": dangling }),
        Some(&seed.token),
    );
    let res = request_ok(
        &mut stdin,
        &mut reader,
        "gen-again",
        "reports.generate",
        json!({ "studentId": seed.student_id, "academicYear": "2024" }),
        Some(&seed.token),
    );
    assert_eq!(res["report"]["overallGrade"], "C");

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn mark_updates_change_the_next_report() {
    let workspace = temp_dir("schoold-report-update");
    let (mut child, mut stdin, mut reader) = spawn_sidecar(&workspace);
    let seed = seed(&mut stdin, &mut reader);

    let math = create_subject(&mut stdin, &mut reader, &seed, "Mathematics", "MAT101");
    let midterm = create_assessment_type(&mut stdin, &mut reader, &seed, "Midterm");
    let mark = record_mark(&mut stdin, &mut reader, &seed, "m1", &math, &midterm, 55.0, None);

    let before = request_ok(
        &mut stdin,
        &mut reader,
        "gen-1",
        "reports.generate",
        json!({ "studentId": seed.student_id, "academicYear": "2024" }),
        Some(&seed.token),
    );
    assert_eq!(before["report"]["overallGrade"], "E");

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "upd",
        "marks.update",
        json!({ "id": mark, "marks": 82, "marksDescription": "Re-marked" }),
        Some(&seed.token),
    );
    assert_eq!(updated["marks"]["marks"], 82.0);
    assert_eq!(updated["marks"]["marksDescription"], "Re-marked");

    let after = request_ok(
        &mut stdin,
        &mut reader,
        "gen-2",
        "reports.generate",
        json!({ "studentId": seed.student_id, "academicYear": "2024" }),
        Some(&seed.token),
    );
    assert_eq!(after["report"]["overallGrade"], "B");
    assert_eq!(
        after["report"]["subjects"][0]["assessments"][0]["description"],
        "Re-marked"
    );
    // The earlier report is unchanged.
    assert_eq!(before["report"]["cumulativePoints"], 55.0);

    drop(stdin);
    let _ = child.wait();
}
