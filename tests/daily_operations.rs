mod test_support;

use serde_json::json;
use test_support::{
    bootstrap_school, create_class, create_student, error_code, request_err, request_ok,
    spawn_sidecar, str_field,
};

#[test]
fn attendance_summary_counts_late_as_attended() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let (_workspace, token) = bootstrap_school(&mut stdin, &mut reader, "schoold-attendance");
    let t = Some(token.as_str());
    let class_id = create_class(&mut stdin, &mut reader, &token, "Grade 1");
    let other_class = create_class(&mut stdin, &mut reader, &token, "Grade 2");
    let pupil = create_student(&mut stdin, &mut reader, &token, "AT-1", &class_id);
    let stranger = create_student(&mut stdin, &mut reader, &token, "AT-2", &other_class);

    let days = [
        ("2024-07-01", "present"),
        ("2024-07-02", "late"),
        ("2024-07-03", "absent"),
        ("2024-07-04", "present"),
    ];
    for (i, (date, status)) in days.iter().enumerate() {
        let saved = request_ok(
            &mut stdin,
            &mut reader,
            &format!("mark-{}", i),
            "attendance.mark",
            json!({
                "classId": class_id,
                "date": date,
                "entries": [
                    { "studentId": pupil, "status": status },
                    { "studentId": stranger, "status": "present" },
                ],
            }),
            t,
        );
        assert_eq!(saved["saved"].as_i64(), Some(1));
        assert_eq!(saved["skipped"].as_array().map(|s| s.len()), Some(1));
    }

    // Re-marking a day replaces the earlier status.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "remark",
        "attendance.mark",
        json!({
            "classId": class_id,
            "date": "2024-07-03",
            "entries": [{ "studentId": pupil, "status": "leave" }],
        }),
        t,
    );

    let bad_status = request_err(
        &mut stdin,
        &mut reader,
        "bad",
        "attendance.mark",
        json!({
            "classId": class_id,
            "date": "2024-07-05",
            "entries": [{ "studentId": pupil, "status": "sleeping" }],
        }),
        t,
    );
    assert_eq!(error_code(&bad_status), "bad_params");

    let summary = request_ok(
        &mut stdin,
        &mut reader,
        "sum",
        "attendance.summary",
        json!({ "studentId": pupil, "from": "2024-07-01", "to": "2024-07-31" }),
        t,
    );
    let row = &summary["students"][0];
    assert_eq!(row["present"].as_i64(), Some(2));
    assert_eq!(row["late"].as_i64(), Some(1));
    assert_eq!(row["leave"].as_i64(), Some(1));
    assert_eq!(row["absent"].as_i64(), Some(0));
    assert_eq!(row["percentage"].as_f64(), Some(75.0));

    let day = request_ok(
        &mut stdin,
        &mut reader,
        "day",
        "attendance.day",
        json!({ "classId": class_id, "date": "2024-07-03" }),
        t,
    );
    assert_eq!(day["students"][0]["status"].as_str(), Some("leave"));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn exam_results_use_competition_ranking() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let (_workspace, token) = bootstrap_school(&mut stdin, &mut reader, "schoold-exams");
    let t = Some(token.as_str());
    let class_id = create_class(&mut stdin, &mut reader, &token, "Grade 10");
    let a = create_student(&mut stdin, &mut reader, &token, "X-1", &class_id);
    let b = create_student(&mut stdin, &mut reader, &token, "X-2", &class_id);
    let c = create_student(&mut stdin, &mut reader, &token, "X-3", &class_id);
    let left = create_student(&mut stdin, &mut reader, &token, "X-4", &class_id);
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "0",
        "students.delete",
        json!({ "studentId": left }),
        t,
    );

    let dup_subject = request_err(
        &mut stdin,
        &mut reader,
        "1",
        "exams.create",
        json!({
            "name": "Mid term",
            "classId": class_id,
            "subjects": [{ "name": "Maths", "maxMarks": 50 }, { "name": "Maths", "maxMarks": 50 }],
        }),
        t,
    );
    assert_eq!(error_code(&dup_subject), "bad_params");

    let exam = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "exams.create",
        json!({
            "name": "Mid term",
            "classId": class_id,
            "subjects": [{ "name": "Maths", "maxMarks": 50 }, { "name": "Science", "maxMarks": 50 }],
        }),
        t,
    );
    let exam_id = str_field(&exam, "examId");

    let too_many = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "exams.recordMarks",
        json!({ "examId": exam_id, "subject": "Maths", "marks": [{ "studentId": a, "marksObtained": 51 }] }),
        t,
    );
    assert_eq!(error_code(&too_many), "bad_params");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "exams.recordMarks",
        json!({
            "examId": exam_id,
            "subject": "Maths",
            "marks": [
                { "studentId": a, "marksObtained": 45 },
                { "studentId": b, "marksObtained": 40 },
                { "studentId": c, "marksObtained": 30 },
            ],
        }),
        t,
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "exams.recordMarks",
        json!({
            "examId": exam_id,
            "subject": "Science",
            "marks": [
                { "studentId": a, "marksObtained": 35 },
                { "studentId": b, "marksObtained": 40 },
                { "studentId": c, "marksObtained": 20 },
            ],
        }),
        t,
    );

    let results = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "exams.results",
        json!({ "examId": exam_id }),
        t,
    );
    let rows = results["results"].as_array().cloned().unwrap_or_default();
    let by_id = |id: &str| {
        rows.iter()
            .find(|r| r["studentId"].as_str() == Some(id))
            .cloned()
            .unwrap_or_default()
    };
    // The removed, unmarked student is not ranked.
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|r| r["studentId"].as_str() != Some(left.as_str())));
    // a and b tie on 80/100; c follows at rank 3.
    assert_eq!(by_id(&a)["rank"].as_i64(), Some(1));
    assert_eq!(by_id(&b)["rank"].as_i64(), Some(1));
    assert_eq!(by_id(&c)["rank"].as_i64(), Some(3));
    assert_eq!(by_id(&a)["grade"].as_str(), Some("A"));
    assert_eq!(by_id(&c)["percentage"].as_f64(), Some(50.0));
    assert_eq!(by_id(&c)["grade"].as_str(), Some("C"));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn library_loans_track_copies_and_overdue_fines() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let (_workspace, token) = bootstrap_school(&mut stdin, &mut reader, "schoold-library");
    let t = Some(token.as_str());
    let class_id = create_class(&mut stdin, &mut reader, &token, "Grade 4");
    let s1 = create_student(&mut stdin, &mut reader, &token, "L-1", &class_id);
    let s2 = create_student(&mut stdin, &mut reader, &token, "L-2", &class_id);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "schools.update",
        json!({ "patch": { "libraryFinePerDay": 2.5 } }),
        t,
    );
    let book = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "library.books.create",
        json!({ "title": "Malgudi Days", "author": "R. K. Narayan", "copies": 1 }),
        t,
    );
    let book_id = str_field(&book, "bookId");

    let loan = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "library.issue",
        json!({ "bookId": book_id, "studentId": s1, "issuedOn": "2024-01-01", "dueDate": "2024-01-10" }),
        t,
    );
    let none_left = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "library.issue",
        json!({ "bookId": book_id, "studentId": s2, "issuedOn": "2024-01-02", "dueDate": "2024-01-12" }),
        t,
    );
    assert_eq!(error_code(&none_left), "bad_params");

    let on_loan = request_err(
        &mut stdin,
        &mut reader,
        "5",
        "library.books.delete",
        json!({ "bookId": book_id }),
        t,
    );
    assert_eq!(error_code(&on_loan), "bad_params");

    let overdue = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "library.loans",
        json!({ "status": "overdue" }),
        t,
    );
    assert_eq!(overdue["loans"].as_array().map(|l| l.len()), Some(1));

    let returned = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "library.return",
        json!({ "loanId": str_field(&loan, "loanId"), "returnedOn": "2024-01-14" }),
        t,
    );
    assert_eq!(returned["daysOverdue"].as_i64(), Some(4));
    assert_eq!(returned["fine"].as_f64(), Some(10.0));

    let twice = request_err(
        &mut stdin,
        &mut reader,
        "8",
        "library.return",
        json!({ "loanId": str_field(&loan, "loanId") }),
        t,
    );
    assert_eq!(error_code(&twice), "bad_params");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "library.issue",
        json!({ "bookId": book_id, "studentId": s2, "issuedOn": "2024-01-15", "dueDate": "2024-01-25" }),
        t,
    );

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn leave_requests_cannot_overlap_and_are_decided_once() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let (_workspace, token) = bootstrap_school(&mut stdin, &mut reader, "schoold-leave");
    let t = Some(token.as_str());
    let staff = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "staff.create",
        json!({ "employeeCode": "LV-1", "firstName": "Asha", "lastName": "Iyer", "roleKind": "teacher" }),
        t,
    );
    let staff_id = str_field(&staff, "id");

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "leave.request",
        json!({ "staffId": staff_id, "fromDate": "2024-08-05", "toDate": "2024-08-07", "reason": "travel" }),
        t,
    );
    assert_eq!(first["days"].as_i64(), Some(3));

    let overlap = request_err(
        &mut stdin,
        &mut reader,
        "3",
        "leave.request",
        json!({ "staffId": staff_id, "fromDate": "2024-08-07", "toDate": "2024-08-09", "reason": "more travel" }),
        t,
    );
    assert_eq!(error_code(&overlap), "bad_params");
    assert_eq!(overlap["details"]["leaveId"].as_str(), first["leaveId"].as_str());

    let decided = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "leave.decide",
        json!({ "leaveId": str_field(&first, "leaveId"), "decision": "rejected", "note": "exam week" }),
        t,
    );
    assert_eq!(decided["status"].as_str(), Some("rejected"));

    let again = request_err(
        &mut stdin,
        &mut reader,
        "5",
        "leave.decide",
        json!({ "leaveId": str_field(&first, "leaveId"), "decision": "approved" }),
        t,
    );
    assert_eq!(error_code(&again), "bad_params");

    // A rejected request no longer blocks the dates.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "leave.request",
        json!({ "staffId": staff_id, "fromDate": "2024-08-07", "toDate": "2024-08-09", "reason": "more travel" }),
        t,
    );
    let pending = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "leave.list",
        json!({ "status": "pending" }),
        t,
    );
    assert_eq!(pending["leaveRequests"].as_array().map(|l| l.len()), Some(1));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn transport_gate_passes_and_dashboard_stay_current() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let (_workspace, token) = bootstrap_school(&mut stdin, &mut reader, "schoold-transport");
    let t = Some(token.as_str());
    let class_id = create_class(&mut stdin, &mut reader, &token, "Grade 3");
    let rider = create_student(&mut stdin, &mut reader, &token, "TR-1", &class_id);

    let before = request_ok(&mut stdin, &mut reader, "1", "dashboard.stats", json!({}), t);
    assert_eq!(before["students"].as_i64(), Some(1));

    let north = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "transport.routes.create",
        json!({ "name": "North", "fare": 600 }),
        t,
    );
    let south = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "transport.routes.create",
        json!({ "name": "South", "fare": 550 }),
        t,
    );
    let north_id = str_field(&north, "routeId");
    let south_id = str_field(&south, "routeId");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "transport.assign",
        json!({ "routeId": north_id, "studentId": rider, "stopName": "Temple Rd" }),
        t,
    );
    let moved = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "transport.assign",
        json!({ "routeId": south_id, "studentId": rider }),
        t,
    );
    assert_eq!(moved["previousRouteId"].as_str(), Some(north_id.as_str()));
    let north_roster = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "transport.roster",
        json!({ "routeId": north_id }),
        t,
    );
    assert_eq!(north_roster["riders"].as_array().map(|r| r.len()), Some(0));

    let p1 = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "gatePasses.issue",
        json!({ "studentId": rider, "reason": "fever", "guardianName": "Father" }),
        t,
    );
    let p2 = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "gatePasses.issue",
        json!({ "studentId": rider, "reason": "wedding", "guardianName": "Mother" }),
        t,
    );
    assert_eq!(p1["serialNo"].as_str(), Some("DEMO-GP1"));
    assert_eq!(p2["serialNo"].as_str(), Some("DEMO-GP2"));

    // Writes invalidate the cached dashboard.
    let _ = create_student(&mut stdin, &mut reader, &token, "TR-2", &class_id);
    let after = request_ok(&mut stdin, &mut reader, "9", "dashboard.stats", json!({}), t);
    assert_eq!(after["students"].as_i64(), Some(2));

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "students.delete",
        json!({ "studentId": rider }),
        t,
    );
    let south_roster = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "transport.roster",
        json!({ "routeId": south_id }),
        t,
    );
    assert_eq!(south_roster["riders"].as_array().map(|r| r.len()), Some(0));

    drop(stdin);
    let _ = child.wait();
}
