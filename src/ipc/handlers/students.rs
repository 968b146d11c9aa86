use crate::audit::{self, AuditEntry};
use crate::dates::{format_date, now_rfc3339, today};
use crate::db::is_unique_violation;
use crate::ipc::error::{db_commit, db_query, db_tx, db_write, HandlerErr};
use crate::ipc::handlers::schools::check_password_strength;
use crate::ipc::handlers::{attendance, fees};
use crate::ipc::helpers::{
    ensure_exists, object_param, optional_bool, optional_date, optional_str, require_conn,
    required_str, respond, run, Handler,
};
use crate::ipc::types::{AppState, Caller, Request};
use crate::password::hash_password;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::path::Path;
use uuid::Uuid;

const MAX_PHOTO_BYTES: u64 = 2 * 1024 * 1024;
const PHOTO_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

const STUDENT_COLUMNS: &str = "s.id, s.admission_no, s.first_name, s.last_name, s.class_id,
     c.name, c.section, s.date_of_birth, s.gender, s.guardian_name, s.guardian_phone,
     s.address, s.photo_path, s.status, s.created_at";

fn student_json(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let first: String = r.get(2)?;
    let last: String = r.get(3)?;
    let class_name: Option<String> = r.get(5)?;
    let section: Option<String> = r.get(6)?;
    let class_label = class_name.map(|n| match section.as_deref() {
        Some(s) if !s.is_empty() => format!("{} {}", n, s),
        _ => n,
    });
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "admissionNo": r.get::<_, String>(1)?,
        "firstName": first,
        "lastName": last,
        "displayName": format!("{}, {}", last, first),
        "classId": r.get::<_, Option<String>>(4)?,
        "className": class_label,
        "dateOfBirth": r.get::<_, Option<String>>(7)?,
        "gender": r.get::<_, Option<String>>(8)?,
        "guardianName": r.get::<_, Option<String>>(9)?,
        "guardianPhone": r.get::<_, Option<String>>(10)?,
        "address": r.get::<_, Option<String>>(11)?,
        "hasPhoto": r.get::<_, Option<String>>(12)?.is_some(),
        "status": r.get::<_, String>(13)?,
        "createdAt": r.get::<_, String>(14)?,
    }))
}

pub fn load_student(
    conn: &Connection,
    school_code: &str,
    student_id: &str,
) -> Result<serde_json::Value, HandlerErr> {
    let sql = format!(
        "SELECT {} FROM students s LEFT JOIN classes c ON c.id = s.class_id
         WHERE s.school_code = ? AND s.id = ?",
        STUDENT_COLUMNS
    );
    conn.query_row(&sql, (school_code, student_id), student_json)
        .optional()
        .map_err(db_query)?
        .ok_or_else(|| HandlerErr::not_found("student"))
}

fn duplicate_admission(e: rusqlite::Error, table_code: &'static str) -> HandlerErr {
    if is_unique_violation(&e) {
        HandlerErr::bad_params("admission number already in use")
            .with_details(json!({ "field": "admissionNo" }))
    } else {
        db_write(table_code, "students")(e)
    }
}

fn students_list(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let class_id = optional_str(params, "classId");
    let search = optional_str(params, "search").map(|s| format!("%{}%", s.to_lowercase()));
    let include_inactive = optional_bool(params, "includeInactive").unwrap_or(false);

    let sql = format!(
        "SELECT {} FROM students s LEFT JOIN classes c ON c.id = s.class_id
         WHERE s.school_code = ?1
           AND (?2 IS NULL OR s.class_id = ?2)
           AND (?3 IS NULL
                OR lower(s.first_name || ' ' || s.last_name) LIKE ?3
                OR lower(s.admission_no) LIKE ?3)
           AND (?4 = 1 OR s.status = 'active')
         ORDER BY s.last_name, s.first_name",
        STUDENT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql).map_err(db_query)?;
    let students = stmt
        .query_map(
            (school, class_id, search, include_inactive as i64),
            student_json,
        )
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(json!({ "students": students }))
}

fn students_get(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let student_id = required_str(params, "studentId")?;
    load_student(conn, school, &student_id)
}

fn students_create(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let admission_no = required_str(params, "admissionNo")?;
    let first_name = required_str(params, "firstName")?;
    let last_name = required_str(params, "lastName")?;
    let class_id = optional_str(params, "classId");
    if let Some(c) = class_id.as_deref() {
        ensure_exists(conn, "classes", "class", school, c)?;
    }
    let dob = optional_date(params, "dateOfBirth")?;

    let student_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO students(
           id, school_code, admission_no, first_name, last_name, class_id,
           date_of_birth, gender, guardian_name, guardian_phone, address, status, created_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'active', ?)",
        rusqlite::params![
            &student_id,
            school,
            &admission_no,
            &first_name,
            &last_name,
            class_id,
            dob.map(format_date),
            optional_str(params, "gender"),
            optional_str(params, "guardianName"),
            optional_str(params, "guardianPhone"),
            optional_str(params, "address"),
            now_rfc3339(),
        ],
    )
    .map_err(|e| duplicate_admission(e, "db_insert_failed"))?;

    audit::record(
        conn,
        AuditEntry {
            school_code: school,
            actor: &caller.actor(),
            action: "students.create",
            entity: "student",
            entity_id: Some(&student_id),
            details: Some(json!({ "admissionNo": admission_no })),
        },
    );
    load_student(conn, school, &student_id)
}

fn students_update(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let student_id = required_str(params, "studentId")?;
    ensure_exists(conn, "students", "student", school, &student_id)?;
    let patch = object_param(params, "patch")?;
    let patch_value = serde_json::Value::Object(patch.clone());

    let mut updates: Vec<(&'static str, Option<String>)> = Vec::new();
    for (key, column, required) in [
        ("admissionNo", "admission_no", true),
        ("firstName", "first_name", true),
        ("lastName", "last_name", true),
        ("gender", "gender", false),
        ("guardianName", "guardian_name", false),
        ("guardianPhone", "guardian_phone", false),
        ("address", "address", false),
    ] {
        if !patch.contains_key(key) {
            continue;
        }
        let value = optional_str(&patch_value, key);
        if required && value.is_none() {
            return Err(HandlerErr::bad_params(format!("{} must not be empty", key)));
        }
        updates.push((column, value));
    }
    if patch.contains_key("classId") {
        let class_id = optional_str(&patch_value, "classId");
        if let Some(c) = class_id.as_deref() {
            ensure_exists(conn, "classes", "class", school, c)?;
        }
        updates.push(("class_id", class_id));
    }
    if patch.contains_key("dateOfBirth") {
        let dob = optional_date(&patch_value, "dateOfBirth")?;
        updates.push(("date_of_birth", dob.map(format_date)));
    }

    if !updates.is_empty() {
        let tx = conn.unchecked_transaction().map_err(db_tx)?;
        for (column, value) in &updates {
            let sql = format!("UPDATE students SET {} = ? WHERE id = ?", column);
            tx.execute(&sql, (value, &student_id))
                .map_err(|e| duplicate_admission(e, "db_update_failed"))?;
        }
        tx.execute(
            "UPDATE students SET updated_at = ? WHERE id = ?",
            (now_rfc3339(), &student_id),
        )
        .map_err(db_write("db_update_failed", "students"))?;
        audit::record(
            &tx,
            AuditEntry {
                school_code: school,
                actor: &caller.actor(),
                action: "students.update",
                entity: "student",
                entity_id: Some(&student_id),
                details: Some(patch_value),
            },
        );
        tx.commit().map_err(db_commit)?;
    }
    load_student(conn, school, &student_id)
}

fn students_delete(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let student_id = required_str(params, "studentId")?;
    ensure_exists(conn, "students", "student", school, &student_id)?;
    conn.execute(
        "UPDATE students SET status = 'inactive', updated_at = ? WHERE id = ?",
        (now_rfc3339(), &student_id),
    )
    .map_err(db_write("db_update_failed", "students"))?;
    // Inactive students ride no bus.
    conn.execute(
        "DELETE FROM transport_assignments WHERE student_id = ?",
        [&student_id],
    )
    .map_err(db_write("db_delete_failed", "transport_assignments"))?;
    audit::record(
        conn,
        AuditEntry {
            school_code: school,
            actor: &caller.actor(),
            action: "students.delete",
            entity: "student",
            entity_id: Some(&student_id),
            details: None,
        },
    );
    Ok(json!({ "ok": true }))
}

fn students_set_password(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let student_id = required_str(params, "studentId")?;
    ensure_exists(conn, "students", "student", school, &student_id)?;
    let password = params
        .get("password")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    check_password_strength(password)?;
    conn.execute(
        "UPDATE students SET password_hash = ? WHERE id = ?",
        (hash_password(password), &student_id),
    )
    .map_err(db_write("db_update_failed", "students"))?;
    audit::record(
        conn,
        AuditEntry {
            school_code: school,
            actor: &caller.actor(),
            action: "students.setPassword",
            entity: "student",
            entity_id: Some(&student_id),
            details: None,
        },
    );
    Ok(json!({ "ok": true }))
}

/// Lower-cased extension of an accepted photo, if any.
fn photo_extension(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    PHOTO_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
}

fn students_set_photo(state: &AppState, caller: &Caller, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = require_conn(state)?;
    let workspace = state
        .workspace
        .as_deref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;
    let school = caller.school()?;
    let student_id = required_str(&req.params, "studentId")?;
    ensure_exists(conn, "students", "student", school, &student_id)?;
    let in_path = std::path::PathBuf::from(required_str(&req.params, "inPath")?);

    let Some(ext) = photo_extension(&in_path) else {
        return Err(HandlerErr::bad_params("photo must be a jpg, jpeg or png file"));
    };
    let meta = std::fs::metadata(&in_path)
        .map_err(|e| HandlerErr::new("io_failed", format!("{}: {}", in_path.display(), e)))?;
    if !meta.is_file() {
        return Err(HandlerErr::bad_params("inPath is not a file"));
    }
    if meta.len() > MAX_PHOTO_BYTES {
        return Err(HandlerErr::bad_params("photo exceeds 2 MiB").with_details(json!({
            "bytes": meta.len(),
            "maxBytes": MAX_PHOTO_BYTES,
        })));
    }

    let dir = workspace.join("photos").join(school);
    std::fs::create_dir_all(&dir).map_err(|e| HandlerErr::new("io_failed", e.to_string()))?;
    let previous: Option<String> = conn
        .query_row(
            "SELECT photo_path FROM students WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .map_err(db_query)?;
    let file_name = format!("{}.{}", student_id, ext);
    let dest = dir.join(&file_name);
    std::fs::copy(&in_path, &dest).map_err(|e| HandlerErr::new("io_failed", e.to_string()))?;

    let relative = format!("photos/{}/{}", school, file_name);
    if let Some(old) = previous.filter(|p| *p != relative) {
        // Old photo stored under a different extension.
        let _ = std::fs::remove_file(workspace.join(old));
    }
    conn.execute(
        "UPDATE students SET photo_path = ?, updated_at = ? WHERE id = ?",
        (&relative, now_rfc3339(), &student_id),
    )
    .map_err(db_write("db_update_failed", "students"))?;
    audit::record(
        conn,
        AuditEntry {
            school_code: school,
            actor: &caller.actor(),
            action: "students.setPhoto",
            entity: "student",
            entity_id: Some(&student_id),
            details: Some(json!({ "bytes": meta.len() })),
        },
    );
    Ok(json!({
        "photoPath": dest.to_string_lossy(),
        "bytes": meta.len(),
    }))
}

fn portal_me(
    conn: &Connection,
    caller: &Caller,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let session = caller.session()?;
    let school = session.school_code.as_str();
    let student_id = session.subject_id.as_str();
    let profile = load_student(conn, school, student_id)?;

    let as_of = today();
    let fee_lines = fees::student_fee_lines(conn, school, student_id, as_of)?;
    let total_due: f64 = fee_lines
        .iter()
        .filter_map(|l| l.get("totalDue").and_then(|v| v.as_f64()))
        .sum();
    let attendance = attendance::student_totals(conn, school, student_id, None, None)?;

    Ok(json!({
        "profile": profile,
        "fees": {
            "items": fee_lines,
            "totalDue": crate::grading::round_off_2_decimals(total_due),
        },
        "attendance": attendance,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request, caller: &Caller) -> Option<serde_json::Value> {
    let handler: Handler = match req.method.as_str() {
        "students.list" => students_list,
        "students.get" => students_get,
        "students.create" => students_create,
        "students.update" => students_update,
        "students.delete" => students_delete,
        "students.setPassword" => students_set_password,
        "portal.me" => portal_me,
        "students.setPhoto" => {
            return Some(respond(&req.id, students_set_photo(state, caller, req)));
        }
        _ => return None,
    };
    Some(run(state, req, caller, handler))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn photo_extensions_are_case_insensitive() {
        assert_eq!(photo_extension(Path::new("/x/a.JPG")).as_deref(), Some("jpg"));
        assert_eq!(photo_extension(Path::new("b.png")).as_deref(), Some("png"));
        assert_eq!(photo_extension(Path::new("c.gif")), None);
        assert_eq!(photo_extension(Path::new("noext")), None);
    }
}
