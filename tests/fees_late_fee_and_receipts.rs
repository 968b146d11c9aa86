mod test_support;

use serde_json::json;
use test_support::{
    bootstrap_school, create_class, create_student, error_code, request_err, request_ok,
    spawn_sidecar, str_field,
};

fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 0.001
}

#[test]
fn per_day_fine_is_settled_first_and_receipts_are_sequential() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let (_workspace, token) = bootstrap_school(&mut stdin, &mut reader, "schoold-fees");
    let t = Some(token.as_str());
    let class_id = create_class(&mut stdin, &mut reader, &token, "Grade 3");
    let student_id = create_student(&mut stdin, &mut reader, &token, "F-100", &class_id);

    let structure = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "fees.structures.create",
        json!({
            "name": "Term 1 tuition",
            "amount": 1000,
            "dueDate": "2024-01-10",
            "graceDays": 5,
            "fineType": "per_day",
            "fineValue": 10,
            "classId": class_id,
        }),
        t,
    );
    let assigned = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "fees.assign",
        json!({ "feeStructureId": str_field(&structure, "feeStructureId") }),
        t,
    );
    assert_eq!(assigned["assigned"].as_i64(), Some(1));

    // Assigning again must not duplicate the line.
    let again = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "fees.assign",
        json!({ "feeStructureId": str_field(&structure, "feeStructureId") }),
        t,
    );
    assert_eq!(again["assigned"].as_i64(), Some(0));
    assert_eq!(again["skipped"].as_i64(), Some(1));

    // Within the grace period there is no fine.
    let early = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "fees.student",
        json!({ "studentId": student_id, "asOf": "2024-01-14" }),
        t,
    );
    let line = &early["fees"][0];
    assert_eq!(line["status"].as_str(), Some("unpaid"));
    assert!(approx(line["lateFee"].as_f64().unwrap_or(-1.0), 0.0));

    // Five days past the grace end: 5 x 10 fine.
    let late = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "fees.student",
        json!({ "studentId": student_id, "asOf": "2024-01-20" }),
        t,
    );
    let line = &late["fees"][0];
    assert_eq!(line["status"].as_str(), Some("overdue"));
    assert_eq!(line["daysLate"].as_i64(), Some(5));
    assert!(approx(line["lateFee"].as_f64().unwrap_or(-1.0), 50.0));
    assert!(approx(late["totalDue"].as_f64().unwrap_or(-1.0), 1050.0));
    let student_fee_id = str_field(line, "studentFeeId");

    let overpay = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "fees.pay",
        json!({
            "studentFeeId": student_fee_id,
            "amount": 2000,
            "method": "cash",
            "paidOn": "2024-01-20",
        }),
        t,
    );
    assert_eq!(error_code(&overpay), "bad_params");

    let bad_method = request_err(
        &mut stdin,
        &mut reader,
        "7",
        "fees.pay",
        json!({ "studentFeeId": student_fee_id, "amount": 10, "method": "barter" }),
        t,
    );
    assert_eq!(error_code(&bad_method), "bad_params");

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "fees.pay",
        json!({
            "studentFeeId": student_fee_id,
            "amount": 300,
            "method": "cash",
            "paidOn": "2024-01-20",
        }),
        t,
    );
    assert_eq!(first["receiptNo"].as_str(), Some("DEMO-R1"));
    assert!(approx(first["fineComponent"].as_f64().unwrap_or(-1.0), 50.0));
    assert!(approx(first["principalComponent"].as_f64().unwrap_or(-1.0), 250.0));
    assert!(approx(first["remainingDue"].as_f64().unwrap_or(-1.0), 750.0));

    let second = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "fees.pay",
        json!({
            "studentFeeId": student_fee_id,
            "amount": 750,
            "method": "upi",
            "reference": "UPI-778",
            "paidOn": "2024-01-20",
        }),
        t,
    );
    assert_eq!(second["receiptNo"].as_str(), Some("DEMO-R2"));
    assert!(approx(second["remainingDue"].as_f64().unwrap_or(-1.0), 0.0));

    let settled = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "fees.student",
        json!({ "studentId": student_id, "asOf": "2024-03-01" }),
        t,
    );
    assert_eq!(settled["fees"][0]["status"].as_str(), Some("paid"));
    assert!(approx(settled["totalDue"].as_f64().unwrap_or(-1.0), 0.0));
    assert_eq!(settled["payments"].as_array().map(|p| p.len()), Some(2));

    let defaulters = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "fees.defaulters",
        json!({ "asOf": "2024-03-01" }),
        t,
    );
    assert_eq!(defaulters["defaulters"].as_array().map(|d| d.len()), Some(0));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn defaulters_are_sorted_by_amount_due() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let (_workspace, token) = bootstrap_school(&mut stdin, &mut reader, "schoold-defaulters");
    let t = Some(token.as_str());
    let class_id = create_class(&mut stdin, &mut reader, &token, "Grade 4");
    let small = create_student(&mut stdin, &mut reader, &token, "D-1", &class_id);
    let large = create_student(&mut stdin, &mut reader, &token, "D-2", &class_id);

    let structure = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "fees.structures.create",
        json!({
            "name": "Lab fee",
            "amount": 400,
            "dueDate": "2024-02-01",
            "fineType": "flat",
            "fineValue": 25,
        }),
        t,
    );
    let structure_id = str_field(&structure, "feeStructureId");
    let missing_students = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "fees.assign",
        json!({ "feeStructureId": structure_id }),
        t,
    );
    assert_eq!(error_code(&missing_students), "bad_params");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "fees.assign",
        json!({ "feeStructureId": structure_id, "studentIds": [small, large] }),
        t,
    );
    let fees = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "fees.student",
        json!({ "studentId": small, "asOf": "2024-02-01" }),
        t,
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "fees.pay",
        json!({
            "studentFeeId": str_field(&fees["fees"][0], "studentFeeId"),
            "amount": 300,
            "method": "card",
            "paidOn": "2024-02-01",
        }),
        t,
    );

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "fees.defaulters",
        json!({ "asOf": "2024-02-10" }),
        t,
    );
    let rows = listed["defaulters"].as_array().cloned().unwrap_or_default();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["studentId"].as_str(), Some(large.as_str()));
    assert!(approx(rows[0]["totalDue"].as_f64().unwrap_or(-1.0), 425.0));
    assert_eq!(rows[1]["studentId"].as_str(), Some(small.as_str()));
    assert!(approx(rows[1]["totalDue"].as_f64().unwrap_or(-1.0), 125.0));

    drop(stdin);
    let _ = child.wait();
}
