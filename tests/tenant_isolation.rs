mod test_support;

use serde_json::json;
use test_support::{
    bootstrap_school, create_class, create_student, error_code, register_school, request_err,
    request_ok, spawn_sidecar, str_field,
};

#[test]
fn schools_share_a_workspace_without_seeing_each_other() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let (workspace, demo) = bootstrap_school(&mut stdin, &mut reader, "schoold-tenants");
    let other = register_school(&mut stdin, &mut reader, "OTHER", "other-pass");
    let a = Some(demo.as_str());
    let b = Some(other.as_str());

    let demo_class = create_class(&mut stdin, &mut reader, &demo, "Grade 4");
    let demo_student = create_student(&mut stdin, &mut reader, &demo, "ADM-1", &demo_class);
    let structure = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "fees.structures.create",
        json!({ "name": "Tuition", "amount": 500, "dueDate": "2024-04-10" }),
        a,
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "fees.assign",
        json!({
            "feeStructureId": str_field(&structure, "feeStructureId"),
            "studentIds": [demo_student],
        }),
        a,
    );

    // Admission numbers only clash inside one school.
    let other_class = create_class(&mut stdin, &mut reader, &other, "Grade 4");
    let other_student = create_student(&mut stdin, &mut reader, &other, "ADM-1", &other_class);
    assert_ne!(other_student, demo_student);

    for (id, method) in [("3", "students.get"), ("4", "fees.student")] {
        let hidden = request_err(
            &mut stdin,
            &mut reader,
            id,
            method,
            json!({ "studentId": demo_student }),
            b,
        );
        assert_eq!(error_code(&hidden), "not_found", "{} leaked across schools", method);
    }
    let listed = request_ok(&mut stdin, &mut reader, "5", "students.list", json!({}), b);
    let ids: Vec<&str> = listed["students"]
        .as_array()
        .map(|s| s.iter().filter_map(|x| x["id"].as_str()).collect())
        .unwrap_or_default();
    assert_eq!(ids, vec![other_student.as_str()]);

    let first = request_ok(&mut stdin, &mut reader, "6", "dashboard.stats", json!({}), a);
    assert_eq!(first["students"].as_i64(), Some(1));

    // A row written behind the service's back shows up only once DEMO's view is dropped.
    {
        let conn = rusqlite::Connection::open(workspace.join("school.sqlite3")).expect("open db");
        conn.execute(
            "INSERT INTO students(id, school_code, admission_no, first_name, last_name, status, created_at)
             VALUES('direct-1', 'DEMO', 'ADM-2', 'Direct', 'Row', 'active', '2024-01-01T00:00:00Z')",
            [],
        )
        .expect("insert student");
    }

    let _ = create_student(&mut stdin, &mut reader, &other, "ADM-2", &other_class);
    let cached = request_ok(&mut stdin, &mut reader, "7", "dashboard.stats", json!({}), a);
    assert_eq!(cached["students"].as_i64(), Some(1));
    let other_stats = request_ok(&mut stdin, &mut reader, "8", "dashboard.stats", json!({}), b);
    assert_eq!(other_stats["students"].as_i64(), Some(2));

    let _ = create_class(&mut stdin, &mut reader, &demo, "Grade 5");
    let refreshed = request_ok(&mut stdin, &mut reader, "9", "dashboard.stats", json!({}), a);
    assert_eq!(refreshed["students"].as_i64(), Some(2));

    drop(stdin);
    let _ = child.wait();
}
