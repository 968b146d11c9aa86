mod test_support;

use serde_json::json;
use test_support::{
    bootstrap_school, create_class, create_student, request, request_as, request_ok,
    spawn_sidecar, str_field,
};

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let health = request(&mut stdin, &mut reader, "1", "health", json!({}));
    assert_eq!(health.get("ok").and_then(|v| v.as_bool()), Some(true));

    let (workspace, token) = bootstrap_school(&mut stdin, &mut reader, "schoold-router-smoke");
    let t = Some(token.as_str());
    let class_id = create_class(&mut stdin, &mut reader, &token, "Grade 5");
    let student_id = create_student(&mut stdin, &mut reader, &token, "A-001", &class_id);

    let staff = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "staff.create",
        json!({
            "employeeCode": "T-01",
            "firstName": "Tara",
            "lastName": "Singh",
            "roleKind": "teacher",
        }),
        t,
    );
    let staff_id = str_field(&staff, "id");
    let year = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "academicYears.create",
        json!({ "name": "2024-25", "startDate": "2024-04-01", "endDate": "2025-03-31" }),
        t,
    );
    let book = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "library.books.create",
        json!({ "title": "Wings of Fire", "copies": 2 }),
        t,
    );
    let route = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "transport.routes.create",
        json!({ "name": "North Loop", "fare": 500 }),
        t,
    );
    let exam = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "exams.create",
        json!({
            "name": "Unit Test 1",
            "classId": class_id,
            "subjects": [{ "name": "Maths", "maxMarks": 50 }],
        }),
        t,
    );

    let export_path = workspace.join("smoke-students.csv");
    let calls = vec![
        ("session.whoami", json!({})),
        ("schools.get", json!({})),
        ("rbac.modules", json!({})),
        ("rbac.roles.list", json!({})),
        ("academicYears.list", json!({})),
        ("academicYears.activate", json!({ "academicYearId": str_field(&year, "academicYearId") })),
        ("classes.list", json!({})),
        ("students.list", json!({ "classId": class_id })),
        ("students.get", json!({ "studentId": student_id })),
        ("staff.list", json!({})),
        ("staff.get", json!({ "staffId": staff_id })),
        (
            "attendance.mark",
            json!({
                "classId": class_id,
                "date": "2024-06-03",
                "entries": [{ "studentId": student_id, "status": "present" }],
            }),
        ),
        ("attendance.day", json!({ "classId": class_id, "date": "2024-06-03" })),
        (
            "attendance.summary",
            json!({ "classId": class_id, "from": "2024-06-01", "to": "2024-06-30" }),
        ),
        ("fees.structures.list", json!({})),
        ("fees.student", json!({ "studentId": student_id })),
        ("fees.defaulters", json!({})),
        ("library.books.list", json!({})),
        (
            "library.issue",
            json!({
                "bookId": str_field(&book, "bookId"),
                "studentId": student_id,
                "dueDate": "2099-01-01",
            }),
        ),
        ("library.loans", json!({ "status": "open" })),
        (
            "transport.assign",
            json!({ "routeId": str_field(&route, "routeId"), "studentId": student_id }),
        ),
        ("transport.roster", json!({ "routeId": str_field(&route, "routeId") })),
        ("transport.routes.list", json!({})),
        (
            "exams.recordMarks",
            json!({
                "examId": str_field(&exam, "examId"),
                "subject": "Maths",
                "marks": [{ "studentId": student_id, "marksObtained": 41 }],
            }),
        ),
        ("exams.results", json!({ "examId": str_field(&exam, "examId") })),
        ("exams.list", json!({})),
        ("certificates.issue", json!({ "studentId": student_id, "kind": "bonafide" })),
        ("certificates.list", json!({})),
        (
            "leave.request",
            json!({
                "staffId": staff_id,
                "fromDate": "2024-07-01",
                "toDate": "2024-07-02",
                "reason": "family function",
            }),
        ),
        ("leave.list", json!({})),
        (
            "gatePasses.issue",
            json!({ "studentId": student_id, "reason": "dentist", "guardianName": "Parent" }),
        ),
        ("gatePasses.list", json!({})),
        (
            "reports.export",
            json!({ "kind": "students", "format": "csv", "outPath": export_path.to_string_lossy() }),
        ),
        ("dashboard.stats", json!({})),
        ("audit.list", json!({ "limit": 10 })),
    ];

    for (i, (method, params)) in calls.into_iter().enumerate() {
        let id = format!("smoke-{}", i);
        let resp = request_as(&mut stdin, &mut reader, &id, method, params, t);
        assert_eq!(
            resp.get("ok").and_then(|v| v.as_bool()),
            Some(true),
            "{} failed: {}",
            method,
            resp
        );
    }

    let unknown = request_as(&mut stdin, &mut reader, "99", "nope.nothing", json!({}), t);
    assert_eq!(
        unknown
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("not_implemented")
    );

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn malformed_lines_get_bad_json_without_killing_the_loop() {
    use std::io::{BufRead, Write};

    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    writeln!(stdin, "{{not json").expect("write");
    stdin.flush().expect("flush");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("json");
    assert_eq!(
        value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("bad_json")
    );

    let health = request(&mut stdin, &mut reader, "after", "health", json!({}));
    assert_eq!(health.get("ok").and_then(|v| v.as_bool()), Some(true));

    drop(stdin);
    let _ = child.wait();
}
