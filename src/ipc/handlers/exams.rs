use crate::audit::{self, AuditEntry};
use crate::dates::now_rfc3339;
use crate::grading::{competition_ranks, grade_for_percentage, percentage, round_off_2_decimals};
use crate::ipc::error::{db_commit, db_query, db_tx, db_write, HandlerErr};
use crate::ipc::helpers::{ensure_exists, optional_str, required_f64, required_str, run, Handler};
use crate::ipc::types::{AppState, Caller, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

fn exam_class(conn: &Connection, school: &str, exam_id: &str) -> Result<String, HandlerErr> {
    conn.query_row(
        "SELECT class_id FROM exams WHERE school_code = ? AND id = ?",
        (school, exam_id),
        |r| r.get(0),
    )
    .optional()
    .map_err(db_query)?
    .ok_or_else(|| HandlerErr::not_found("exam"))
}

fn exam_subjects(conn: &Connection, exam_id: &str) -> Result<Vec<(String, f64)>, HandlerErr> {
    let mut stmt = conn
        .prepare("SELECT name, max_marks FROM exam_subjects WHERE exam_id = ? ORDER BY sort_order")
        .map_err(db_query)?;
    let rows = stmt
        .query_map([exam_id], |r| Ok((r.get(0)?, r.get(1)?)))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(rows)
}

fn exams_list(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let class_id = optional_str(params, "classId");
    let mut stmt = conn
        .prepare(
            "SELECT e.id, e.name, e.class_id, c.name, e.academic_year_id, e.created_at
             FROM exams e JOIN classes c ON c.id = e.class_id
             WHERE e.school_code = ?1 AND (?2 IS NULL OR e.class_id = ?2)
             ORDER BY e.created_at DESC",
        )
        .map_err(db_query)?;
    let mut exams = stmt
        .query_map((school, class_id), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "classId": r.get::<_, String>(2)?,
                "className": r.get::<_, String>(3)?,
                "academicYearId": r.get::<_, Option<String>>(4)?,
                "createdAt": r.get::<_, String>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    for exam in exams.iter_mut() {
        let id = exam["id"].as_str().unwrap_or_default().to_string();
        let subjects: Vec<serde_json::Value> = exam_subjects(conn, &id)?
            .into_iter()
            .map(|(name, max)| json!({ "name": name, "maxMarks": max }))
            .collect();
        exam["subjects"] = json!(subjects);
    }
    Ok(json!({ "exams": exams }))
}

fn exams_create(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let name = required_str(params, "name")?;
    let class_id = required_str(params, "classId")?;
    ensure_exists(conn, "classes", "class", school, &class_id)?;
    let year_id = optional_str(params, "academicYearId");
    if let Some(y) = year_id.as_deref() {
        ensure_exists(conn, "academic_years", "academic year", school, y)?;
    }
    let raw_subjects = params
        .get("subjects")
        .and_then(|v| v.as_array())
        .filter(|a| !a.is_empty())
        .ok_or_else(|| HandlerErr::bad_params("subjects must be a non-empty list"))?;

    let mut seen = HashSet::new();
    let mut subjects = Vec::with_capacity(raw_subjects.len());
    for s in raw_subjects {
        let subject = required_str(s, "name")?;
        let max = required_f64(s, "maxMarks")?;
        if max <= 0.0 {
            return Err(HandlerErr::bad_params("maxMarks must be positive")
                .with_details(json!({ "subject": subject })));
        }
        if !seen.insert(subject.to_lowercase()) {
            return Err(HandlerErr::bad_params(format!("duplicate subject: {}", subject)));
        }
        subjects.push((subject, max));
    }

    let exam_id = Uuid::new_v4().to_string();
    let tx = conn.unchecked_transaction().map_err(db_tx)?;
    tx.execute(
        "INSERT INTO exams(id, school_code, name, class_id, academic_year_id, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&exam_id, school, &name, &class_id, year_id, now_rfc3339()),
    )
    .map_err(db_write("db_insert_failed", "exams"))?;
    for (i, (subject, max)) in subjects.iter().enumerate() {
        tx.execute(
            "INSERT INTO exam_subjects(exam_id, name, max_marks, sort_order) VALUES(?, ?, ?, ?)",
            (&exam_id, subject, max, i as i64),
        )
        .map_err(db_write("db_insert_failed", "exam_subjects"))?;
    }
    audit::record(
        &tx,
        AuditEntry {
            school_code: school,
            actor: &caller.actor(),
            action: "exams.create",
            entity: "exam",
            entity_id: Some(&exam_id),
            details: Some(json!({ "name": name, "subjects": subjects.len() })),
        },
    );
    tx.commit().map_err(db_commit)?;
    Ok(json!({ "examId": exam_id, "name": name }))
}

fn exams_record_marks(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let exam_id = required_str(params, "examId")?;
    let class_id = exam_class(conn, school, &exam_id)?;
    let subject = required_str(params, "subject")?;
    let Some(max) = exam_subjects(conn, &exam_id)?
        .into_iter()
        .find(|(name, _)| *name == subject)
        .map(|(_, max)| max)
    else {
        return Err(HandlerErr::not_found("subject").with_details(json!({ "subject": subject })));
    };
    let marks = params
        .get("marks")
        .and_then(|v| v.as_array())
        .ok_or_else(|| HandlerErr::bad_params("missing marks"))?;

    let mut stmt = conn
        .prepare("SELECT 1 FROM students WHERE id = ? AND school_code = ? AND class_id = ?")
        .map_err(db_query)?;
    let mut rows = Vec::with_capacity(marks.len());
    for (i, m) in marks.iter().enumerate() {
        let student_id = required_str(m, "studentId")?;
        let obtained = required_f64(m, "marksObtained")?;
        if !(0.0..=max).contains(&obtained) {
            return Err(HandlerErr::bad_params(format!(
                "marksObtained must be between 0 and {}",
                max
            ))
            .with_details(json!({ "index": i, "studentId": student_id })));
        }
        let in_class = stmt
            .query_row((&student_id, school, &class_id), |r| r.get::<_, i64>(0))
            .optional()
            .map_err(db_query)?
            .is_some();
        if !in_class {
            return Err(HandlerErr::bad_params("student is not in the exam's class")
                .with_details(json!({ "index": i, "studentId": student_id })));
        }
        rows.push((student_id, obtained));
    }

    let tx = conn.unchecked_transaction().map_err(db_tx)?;
    for (student_id, obtained) in &rows {
        tx.execute(
            "INSERT INTO exam_marks(exam_id, subject, student_id, marks_obtained) VALUES(?, ?, ?, ?)
             ON CONFLICT(exam_id, subject, student_id) DO UPDATE SET
               marks_obtained = excluded.marks_obtained",
            (&exam_id, &subject, student_id, obtained),
        )
        .map_err(db_write("db_insert_failed", "exam_marks"))?;
    }
    audit::record(
        &tx,
        AuditEntry {
            school_code: school,
            actor: &caller.actor(),
            action: "exams.recordMarks",
            entity: "exam",
            entity_id: Some(&exam_id),
            details: Some(json!({ "subject": subject, "count": rows.len() })),
        },
    );
    tx.commit().map_err(db_commit)?;
    Ok(json!({ "saved": rows.len() }))
}

fn exams_results(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let exam_id = required_str(params, "examId")?;
    let class_id = exam_class(conn, school, &exam_id)?;
    let subjects = exam_subjects(conn, &exam_id)?;
    let max_total: f64 = subjects.iter().map(|(_, m)| m).sum();

    let mut marks: HashMap<(String, String), f64> = HashMap::new();
    {
        let mut stmt = conn
            .prepare("SELECT student_id, subject, marks_obtained FROM exam_marks WHERE exam_id = ?")
            .map_err(db_query)?;
        let rows = stmt
            .query_map([&exam_id], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, f64>(2)?))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(db_query)?;
        for (student, subject, m) in rows {
            marks.insert((student, subject), m);
        }
    }

    // Active class members, plus anyone with marks who has since left or moved.
    let mut stmt = conn
        .prepare(
            "SELECT id, admission_no, last_name || ', ' || first_name FROM students
             WHERE school_code = ?1
               AND ((class_id = ?2 AND status = 'active')
                    OR id IN (SELECT student_id FROM exam_marks WHERE exam_id = ?3))
             ORDER BY last_name, first_name",
        )
        .map_err(db_query)?;
    let students: Vec<(String, String, String)> = stmt
        .query_map((school, &class_id, &exam_id), |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;

    let totals: Vec<f64> = students
        .iter()
        .map(|(id, _, _)| {
            subjects
                .iter()
                .filter_map(|(s, _)| marks.get(&(id.clone(), s.clone())))
                .sum::<f64>()
        })
        .collect();
    let ranks = competition_ranks(&totals);

    let results: Vec<serde_json::Value> = students
        .iter()
        .zip(totals.iter())
        .zip(ranks.iter())
        .map(|(((id, admission_no, name), total), rank)| {
            let per_subject: Vec<serde_json::Value> = subjects
                .iter()
                .map(|(s, max)| {
                    json!({
                        "subject": s,
                        "maxMarks": max,
                        "marksObtained": marks.get(&(id.clone(), s.clone())),
                    })
                })
                .collect();
            let pct = percentage(*total, max_total);
            json!({
                "studentId": id,
                "admissionNo": admission_no,
                "displayName": name,
                "subjects": per_subject,
                "total": round_off_2_decimals(*total),
                "maxTotal": max_total,
                "percentage": pct,
                "grade": grade_for_percentage(pct),
                "rank": rank,
            })
        })
        .collect();

    Ok(json!({
        "examId": exam_id,
        "maxTotal": max_total,
        "results": results,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request, caller: &Caller) -> Option<serde_json::Value> {
    let handler: Handler = match req.method.as_str() {
        "exams.list" => exams_list,
        "exams.create" => exams_create,
        "exams.recordMarks" => exams_record_marks,
        "exams.results" => exams_results,
        _ => return None,
    };
    Some(run(state, req, caller, handler))
}
