#![allow(dead_code)]

use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

pub const SCHOOL: &str = "DEMO";
pub const ADMIN_PASSWORD: &str = "admin-pass";

pub fn temp_dir(prefix: &str) -> PathBuf {
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

pub fn spawn_sidecar_with(args: &[&str]) -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_schoold");
    let mut child = Command::new(exe)
        .args(args)
        .env("SCHOOLD_SESSION_SECRET", "integration-test-secret")
        .env_remove("SCHOOLD_WORKSPACE")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn schoold");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

pub fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    spawn_sidecar_with(&[])
}

pub fn request_as(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
    session: Option<&str>,
) -> serde_json::Value {
    let mut payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    if let Some(token) = session {
        payload["session"] = json!(token);
    }
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

pub fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    request_as(stdin, reader, id, method, params, None)
}

pub fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
    session: Option<&str>,
) -> serde_json::Value {
    let value = request_as(stdin, reader, id, method, params, session);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

/// Error object of a failed call; panics when the call succeeded.
pub fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
    session: Option<&str>,
) -> serde_json::Value {
    let value = request_as(stdin, reader, id, method, params, session);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value.get("error").cloned().expect("error object")
}

pub fn error_code(error: &serde_json::Value) -> &str {
    error.get("code").and_then(|v| v.as_str()).unwrap_or("")
}

pub fn str_field(v: &serde_json::Value, key: &str) -> String {
    v.get(key)
        .and_then(|x| x.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", key, v))
        .to_string()
}

/// Registers `code` in the selected workspace and signs in as its admin.
/// Returns the admin session token.
pub fn register_school(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    code: &str,
    password: &str,
) -> String {
    let _ = request_ok(
        stdin,
        reader,
        &format!("register-{}", code),
        "schools.register",
        json!({
            "schoolCode": code,
            "name": format!("{} Public School", code),
            "adminPassword": password,
        }),
        None,
    );
    let login = request_ok(
        stdin,
        reader,
        &format!("login-{}", code),
        "session.login",
        json!({ "kind": "admin", "schoolCode": code, "password": password }),
        None,
    );
    str_field(&login, "token")
}

/// Opens a fresh workspace, registers the demo school and signs in as its admin.
pub fn bootstrap_school(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    prefix: &str,
) -> (PathBuf, String) {
    let workspace = temp_dir(prefix);
    let _ = request_ok(
        stdin,
        reader,
        "boot-1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
        None,
    );
    let token = register_school(stdin, reader, SCHOOL, ADMIN_PASSWORD);
    (workspace, token)
}

pub fn create_class(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    token: &str,
    name: &str,
) -> String {
    let created = request_ok(
        stdin,
        reader,
        &format!("class-{}", name),
        "classes.create",
        json!({ "name": name }),
        Some(token),
    );
    str_field(&created, "classId")
}

pub fn create_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    token: &str,
    admission_no: &str,
    class_id: &str,
) -> String {
    let created = request_ok(
        stdin,
        reader,
        &format!("student-{}", admission_no),
        "students.create",
        json!({
            "admissionNo": admission_no,
            "firstName": "Pupil",
            "lastName": admission_no,
            "classId": class_id,
        }),
        Some(token),
    );
    str_field(&created, "id")
}
