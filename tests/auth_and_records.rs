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

fn create_school(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> String {
    let res = request_ok(
        stdin,
        reader,
        "school",
        "schools.create",
        json!({
            "name": "Riverside Academy",
            "address": "4 River Lane",
            "phoneNumber": "555-0100",
            "email": "admin@riverside.example",
        }),
        None,
    );
    res["school"]["id"].as_str().expect("school id").to_string()
}

fn register(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    school_id: &str,
    name: &str,
    email: &str,
    role: &str,
) -> serde_json::Value {
    request_ok(
        stdin,
        reader,
        &format!("register-{}", email),
        "users.register",
        json!({
            "name": name,
            "email": email,
            "password": "secret-pass",
            "role": role,
            "schoolId": school_id,
        }),
        None,
    )
}

#[test]
fn protected_methods_need_a_valid_access_token() {
    let workspace = temp_dir("schoold-auth-guard");
    let (mut child, mut stdin, mut reader) = spawn_sidecar(&workspace);

    let health = request_ok(&mut stdin, &mut reader, "health", "health", json!({}), None);
    assert!(health["version"].is_string());

    let missing = request(&mut stdin, &mut reader, "1", "marks.list", json!({}), None);
    assert_eq!(error_code(&missing), "unauthorized");

    let bogus = request(
        &mut stdin,
        &mut reader,
        "2",
        "marks.list",
        json!({}),
        Some("not-a-token"),
    );
    assert_eq!(error_code(&bogus), "forbidden");

    let school_id = create_school(&mut stdin, &mut reader);
    let registered = register(
        &mut stdin,
        &mut reader,
        &school_id,
        "Alan Turing",
        "alan@riverside.example",
        "teacher",
    );
    assert!(registered["user"].get("passwordHash").is_none());
    assert_eq!(registered["user"]["role"], "teacher");

    // A refresh token is not accepted where an access token is required.
    let refresh = registered["refreshToken"].as_str().expect("refresh token");
    let wrong_kind = request(
        &mut stdin,
        &mut reader,
        "3",
        "users.list",
        json!({}),
        Some(refresh),
    );
    assert_eq!(error_code(&wrong_kind), "forbidden");

    let access = registered["accessToken"].as_str().expect("access token");
    let users = request_ok(&mut stdin, &mut reader, "4", "users.list", json!({}), Some(access));
    assert_eq!(users["users"].as_array().map(Vec::len), Some(1));

    let unknown = request(&mut stdin, &mut reader, "5", "fees.list", json!({}), Some(access));
    assert_eq!(error_code(&unknown), "not_implemented");

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn login_and_refresh_issue_working_tokens() {
    let workspace = temp_dir("schoold-auth-login");
    let (mut child, mut stdin, mut reader) = spawn_sidecar(&workspace);
    let school_id = create_school(&mut stdin, &mut reader);
    register(
        &mut stdin,
        &mut reader,
        &school_id,
        "Barbara Liskov",
        "barbara@riverside.example",
        "admin",
    );

    let unknown = request(
        &mut stdin,
        &mut reader,
        "1",
        "auth.login",
        json!({ "email": "nobody@riverside.example", "password": "secret-pass" }),
        None,
    );
    assert_eq!(error_code(&unknown), "invalid_credentials");

    let wrong = request(
        &mut stdin,
        &mut reader,
        "2",
        "auth.login",
        json!({ "email": "barbara@riverside.example", "password": "nope-nope" }),
        None,
    );
    assert_eq!(error_code(&wrong), "invalid_credentials");

    // Emails match case-insensitively.
    let login = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "auth.login",
        json!({ "email": "Barbara@Riverside.example", "password": "secret-pass" }),
        None,
    );
    assert_eq!(login["message"], "Login successful");
    assert_eq!(login["user"]["email"], "barbara@riverside.example");
    let refresh_token = login["refreshToken"].as_str().expect("refresh token");

    let missing = request(&mut stdin, &mut reader, "4", "auth.refresh", json!({}), None);
    assert_eq!(error_code(&missing), "unauthorized");

    let access_as_refresh = request(
        &mut stdin,
        &mut reader,
        "5",
        "auth.refresh",
        json!({ "refreshToken": login["accessToken"] }),
        None,
    );
    assert_eq!(error_code(&access_as_refresh), "forbidden");

    let refreshed = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "auth.refresh",
        json!({ "refreshToken": refresh_token }),
        None,
    );
    let access = refreshed["accessToken"].as_str().expect("access token");
    request_ok(&mut stdin, &mut reader, "7", "users.list", json!({}), Some(access));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn registration_and_school_validation() {
    let workspace = temp_dir("schoold-register-rules");
    let (mut child, mut stdin, mut reader) = spawn_sidecar(&workspace);

    let empty = request(&mut stdin, &mut reader, "1", "schools.list", json!({}), None);
    assert_eq!(error_code(&empty), "not_found");

    let school_id = create_school(&mut stdin, &mut reader);
    let dup_school = request(
        &mut stdin,
        &mut reader,
        "2",
        "schools.create",
        json!({
            "name": "Riverside Two",
            "address": "5 River Lane",
            "phoneNumber": "555-0101",
            "email": "admin@riverside.example",
        }),
        None,
    );
    assert_eq!(error_code(&dup_school), "conflict");

    let bad_email = request(
        &mut stdin,
        &mut reader,
        "3",
        "users.register",
        json!({
            "name": "X", "email": "not-an-email", "password": "secret-pass",
            "role": "student", "schoolId": school_id,
        }),
        None,
    );
    assert_eq!(error_code(&bad_email), "bad_params");

    let short_password = request(
        &mut stdin,
        &mut reader,
        "4",
        "users.register",
        json!({
            "name": "X", "email": "x@riverside.example", "password": "123",
            "role": "student", "schoolId": school_id,
        }),
        None,
    );
    assert_eq!(error_code(&short_password), "bad_params");

    let bad_role = request(
        &mut stdin,
        &mut reader,
        "5",
        "users.register",
        json!({
            "name": "X", "email": "x@riverside.example", "password": "secret-pass",
            "role": "janitor", "schoolId": school_id,
        }),
        None,
    );
    assert_eq!(error_code(&bad_role), "bad_params");

    let no_school = request(
        &mut stdin,
        &mut reader,
        "6",
        "users.register",
        json!({
            "name": "X", "email": "x@riverside.example", "password": "secret-pass",
            "role": "student", "schoolId": "missing",
        }),
        None,
    );
    assert_eq!(error_code(&no_school), "not_found");

    register(
        &mut stdin,
        &mut reader,
        &school_id,
        "Student One",
        "one@riverside.example",
        "student",
    );
    let dup_user = request(
        &mut stdin,
        &mut reader,
        "7",
        "users.register",
        json!({
            "name": "Student Again", "email": "one@riverside.example",
            "password": "secret-pass", "role": "student", "schoolId": school_id,
        }),
        None,
    );
    assert_eq!(error_code(&dup_user), "conflict");

    let school = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "schools.get",
        json!({ "id": school_id }),
        None,
    );
    assert_eq!(school["school"]["name"], "Riverside Academy");

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn subjects_classes_and_marks_validate_references() {
    let workspace = temp_dir("schoold-records");
    let (mut child, mut stdin, mut reader) = spawn_sidecar(&workspace);
    let school_id = create_school(&mut stdin, &mut reader);
    let teacher = register(
        &mut stdin,
        &mut reader,
        &school_id,
        "Edsger Dijkstra",
        "edsger@riverside.example",
        "teacher",
    );
    let teacher_id = teacher["user"]["id"].as_str().expect("teacher id").to_string();
    let token = teacher["accessToken"].as_str().expect("token").to_string();
    let student = register(
        &mut stdin,
        &mut reader,
        &school_id,
        "Margaret Hamilton",
        "margaret@riverside.example",
        "student",
    );
    let student_id = student["user"]["id"].as_str().expect("student id").to_string();
    let tok = Some(token.as_str());

    let short_code = request(
        &mut stdin,
        &mut reader,
        "s1",
        "subjects.create",
        json!({ "name": "Physics", "code": "PH", "teachers": [teacher_id], "schoolId": school_id }),
        tok,
    );
    assert_eq!(error_code(&short_code), "bad_params");

    let no_teachers = request(
        &mut stdin,
        &mut reader,
        "s2",
        "subjects.create",
        json!({ "name": "Physics", "code": "PHY101", "teachers": [], "schoolId": school_id }),
        tok,
    );
    assert_eq!(error_code(&no_teachers), "bad_params");

    let student_as_teacher = request(
        &mut stdin,
        &mut reader,
        "s3",
        "subjects.create",
        json!({ "name": "Physics", "code": "PHY101", "teachers": [student_id], "schoolId": school_id }),
        tok,
    );
    assert_eq!(error_code(&student_as_teacher), "bad_params");

    let subject = request_ok(
        &mut stdin,
        &mut reader,
        "s4",
        "subjects.create",
        json!({ "name": "Physics", "code": "PHY101", "teachers": [teacher_id], "schoolId": school_id }),
        tok,
    );
    let subject_id = subject["subject"]["id"].as_str().expect("subject id").to_string();
    assert_eq!(subject["subject"]["teachers"][0]["id"], teacher_id.as_str());

    let dup_code = request(
        &mut stdin,
        &mut reader,
        "s5",
        "subjects.create",
        json!({ "name": "Physics II", "code": "PHY101", "teachers": [teacher_id], "schoolId": school_id }),
        tok,
    );
    assert_eq!(error_code(&dup_code), "conflict");

    let bad_class = request(
        &mut stdin,
        &mut reader,
        "c1",
        "classes.create",
        json!({
            "name": "Form 1A", "grade": "1", "classTeacherId": student_id,
            "schoolId": school_id,
        }),
        tok,
    );
    assert_eq!(error_code(&bad_class), "bad_params");

    let class = request_ok(
        &mut stdin,
        &mut reader,
        "c2",
        "classes.create",
        json!({
            "name": "Form 1A", "grade": "1", "classTeacherId": teacher_id,
            "subjectTeacherIds": [teacher_id], "students": [student_id],
            "subjects": [subject_id], "femaleLeaderId": student_id,
            "schoolId": school_id,
        }),
        tok,
    );
    let class_id = class["class"]["id"].as_str().expect("class id").to_string();
    assert_eq!(class["class"]["classTeacher"]["id"], teacher_id.as_str());
    assert_eq!(class["class"]["students"][0]["id"], student_id.as_str());
    assert_eq!(class["class"]["subjects"][0]["name"], "Physics");
    assert_eq!(
        class["class"]["classLeaders"]["femaleLeader"]["id"],
        student_id.as_str()
    );

    let renamed = request_ok(
        &mut stdin,
        &mut reader,
        "c3",
        "classes.update",
        json!({ "id": class_id, "name": "Form 1B", "students": [] }),
        tok,
    );
    assert_eq!(renamed["class"]["name"], "Form 1B");
    assert_eq!(renamed["class"]["students"].as_array().map(Vec::len), Some(0));
    assert_eq!(renamed["class"]["subjects"].as_array().map(Vec::len), Some(1));

    let assessment = request_ok(
        &mut stdin,
        &mut reader,
        "a1",
        "assessmentTypes.create",
        json!({ "name": "Quiz", "description": "Short weekly quiz" }),
        tok,
    );
    let assessment_id = assessment["assessmentType"]["id"]
        .as_str()
        .expect("assessment id")
        .to_string();
    let dup_assessment = request(
        &mut stdin,
        &mut reader,
        "a2",
        "assessmentTypes.create",
        json!({ "name": "Quiz" }),
        tok,
    );
    assert_eq!(error_code(&dup_assessment), "conflict");

    let mark_params = |overrides: serde_json::Value| {
        let mut p = json!({
            "student": student_id,
            "subject": subject_id,
            "subjectTeacher": teacher_id,
            "assessmentType": assessment_id,
            "marks": 18,
            "totalPossibleScore": 20,
            "school": school_id,
        });
        if let (Some(base), Some(extra)) = (p.as_object_mut(), overrides.as_object()) {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
        }
        p
    };

    let bad_type = request(
        &mut stdin,
        &mut reader,
        "m1",
        "marks.create",
        mark_params(json!({ "assessmentType": "missing" })),
        tok,
    );
    assert_eq!(error_code(&bad_type), "bad_params");
    assert_eq!(bad_type["error"]["message"], "Invalid assessment type");

    let teacher_as_student = request(
        &mut stdin,
        &mut reader,
        "m2",
        "marks.create",
        mark_params(json!({ "student": teacher_id })),
        tok,
    );
    assert_eq!(error_code(&teacher_as_student), "bad_params");

    let negative = request(
        &mut stdin,
        &mut reader,
        "m3",
        "marks.create",
        mark_params(json!({ "marks": -1 })),
        tok,
    );
    assert_eq!(error_code(&negative), "bad_params");

    let zero_total = request(
        &mut stdin,
        &mut reader,
        "m4",
        "marks.create",
        mark_params(json!({ "totalPossibleScore": 0 })),
        tok,
    );
    assert_eq!(error_code(&zero_total), "bad_params");

    let empty_marks = request(&mut stdin, &mut reader, "m5", "marks.list", json!({}), tok);
    assert_eq!(error_code(&empty_marks), "not_found");

    let mark = request_ok(
        &mut stdin,
        &mut reader,
        "m6",
        "marks.create",
        mark_params(json!({})),
        tok,
    );
    assert_eq!(mark["marks"]["subject"]["code"], "PHY101");
    assert_eq!(mark["marks"]["totalPossibleScore"], 20.0);
    assert!(mark["marks"].get("grade").is_none());

    let for_student = request_ok(
        &mut stdin,
        &mut reader,
        "m7",
        "marks.forStudent",
        json!({ "studentId": student_id }),
        tok,
    );
    assert_eq!(for_student["marks"].as_array().map(Vec::len), Some(1));

    let missing_mark = request(
        &mut stdin,
        &mut reader,
        "m8",
        "marks.update",
        json!({ "id": "missing", "marks": 3 }),
        tok,
    );
    assert_eq!(error_code(&missing_mark), "not_found");

    request_ok(
        &mut stdin,
        &mut reader,
        "c4",
        "classes.delete",
        json!({ "id": class_id }),
        tok,
    );
    let gone = request(
        &mut stdin,
        &mut reader,
        "c5",
        "classes.get",
        json!({ "id": class_id }),
        tok,
    );
    assert_eq!(error_code(&gone), "not_found");

    // The school still owns users and records.
    let busy = request(
        &mut stdin,
        &mut reader,
        "sch",
        "schools.delete",
        json!({ "id": school_id }),
        tok,
    );
    assert_eq!(error_code(&busy), "conflict");

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn malformed_lines_get_bad_json() {
    let workspace = temp_dir("schoold-bad-json");
    let (mut child, mut stdin, mut reader) = spawn_sidecar(&workspace);

    writeln!(stdin, "{{not json").expect("write");
    stdin.flush().expect("flush");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("json");
    assert_eq!(value["ok"], false);
    assert_eq!(error_code(&value), "bad_json");

    // The loop keeps serving after a bad line.
    request_ok(&mut stdin, &mut reader, "after", "health", json!({}), None);

    drop(stdin);
    let _ = child.wait();
}
