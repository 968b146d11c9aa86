mod test_support;

use serde_json::json;
use std::io::Read;
use test_support::{
    bootstrap_school, create_class, create_student, error_code, request_err, request_ok,
    spawn_sidecar, str_field,
};

#[test]
fn exports_write_csv_and_xlsx_files() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let (workspace, token) = bootstrap_school(&mut stdin, &mut reader, "schoold-export");
    let t = Some(token.as_str());
    let class_id = create_class(&mut stdin, &mut reader, &token, "Grade 5");
    let s1 = create_student(&mut stdin, &mut reader, &token, "E-1", &class_id);
    let s2 = create_student(&mut stdin, &mut reader, &token, "E-2", &class_id);

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "attendance.mark",
        json!({
            "classId": class_id,
            "date": "2024-06-03",
            "entries": [
                { "studentId": s1, "status": "present" },
                { "studentId": s2, "status": "absent" },
            ],
        }),
        t,
    );

    let csv_path = workspace.join("exports").join("students.csv");
    let csv = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "reports.export",
        json!({ "kind": "students", "format": "csv", "outPath": csv_path.to_string_lossy() }),
        t,
    );
    assert_eq!(csv["rowsExported"].as_u64(), Some(2));
    let text = std::fs::read_to_string(&csv_path).expect("read csv");
    let mut lines = text.lines();
    assert!(lines.next().unwrap_or("").starts_with("admission_no,"));
    assert_eq!(lines.count(), 2);

    // Missing extension is filled in from the format.
    let xlsx_base = workspace.join("exports").join("attendance");
    let xlsx = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "reports.export",
        json!({
            "kind": "attendance",
            "format": "xlsx",
            "classId": class_id,
            "from": "2024-06-01",
            "to": "2024-06-30",
            "outPath": xlsx_base.to_string_lossy(),
        }),
        t,
    );
    assert_eq!(xlsx["rowsExported"].as_u64(), Some(2));
    assert_eq!(xlsx["fileName"].as_str(), Some("attendance.xlsx"));
    let file = std::fs::File::open(str_field(&xlsx, "path")).expect("open xlsx");
    let mut archive = zip::ZipArchive::new(file).expect("xlsx is a zip");
    let mut sheet = String::new();
    archive
        .by_name("xl/worksheets/sheet1.xml")
        .expect("sheet entry")
        .read_to_string(&mut sheet)
        .expect("read sheet");
    assert!(sheet.contains("E-1"));
    assert!(sheet.contains("absent"));

    let unknown = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "reports.export",
        json!({ "kind": "canteen", "outPath": csv_path.to_string_lossy() }),
        t,
    );
    assert_eq!(error_code(&unknown), "bad_params");

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn certificate_serials_count_per_kind_and_bulk_issue_reports_bad_lines() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let (_workspace, token) = bootstrap_school(&mut stdin, &mut reader, "schoold-certs");
    let t = Some(token.as_str());
    let class_id = create_class(&mut stdin, &mut reader, &token, "Grade 12");
    let s1 = create_student(&mut stdin, &mut reader, &token, "C-1", &class_id);
    let _ = create_student(&mut stdin, &mut reader, &token, "C-2", &class_id);

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "certificates.issue",
        json!({ "studentId": s1, "kind": "Bonafide" }),
        t,
    );
    assert_eq!(first["serialNo"].as_str(), Some("DEMO/BONAFIDE/1"));

    let bad_kind = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "certificates.issue",
        json!({ "studentId": s1, "kind": "award" }),
        t,
    );
    assert_eq!(error_code(&bad_kind), "bad_params");

    let csv = "admission_no,kind,remarks\n\
               C-1,transfer,moving city\n\
               C-2,bonafide,\n\
               C-404,bonafide,\n\
               C-2,award,\n\
               ,character,\n";
    let bulk = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "certificates.bulkIssue",
        json!({ "csv": csv }),
        t,
    );
    let issued = bulk["issued"].as_array().cloned().unwrap_or_default();
    assert_eq!(issued.len(), 2);
    assert_eq!(issued[0]["serialNo"].as_str(), Some("DEMO/TRANSFER/1"));
    assert_eq!(issued[1]["serialNo"].as_str(), Some("DEMO/BONAFIDE/2"));
    let warned: Vec<i64> = bulk["warnings"]
        .as_array()
        .cloned()
        .unwrap_or_default()
        .iter()
        .filter_map(|w| w["line"].as_i64())
        .collect();
    assert_eq!(warned, vec![4, 5, 6]);

    let bad_header = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "certificates.bulkIssue",
        json!({ "csv": "student,type\nC-1,bonafide\n" }),
        t,
    );
    assert_eq!(error_code(&bad_header), "bad_params");

    let revoked = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "certificates.revoke",
        json!({ "certificateId": str_field(&first, "certificateId") }),
        t,
    );
    assert_eq!(revoked["ok"].as_bool(), Some(true));
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "certificates.list",
        json!({ "studentId": s1 }),
        t,
    );
    assert_eq!(listed["certificates"].as_array().map(|c| c.len()), Some(2));

    drop(stdin);
    let _ = child.wait();
}
