use crate::audit::{self, AuditEntry};
use crate::dates::now_rfc3339;
use crate::db::{is_foreign_key_violation, is_unique_violation};
use crate::ipc::error::{db_commit, db_query, db_tx, db_write, HandlerErr};
use crate::ipc::helpers::{ensure_exists, optional_str, required_str, run, Handler};
use crate::ipc::types::{AppState, Caller, Request};
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

fn classes_list(
    conn: &Connection,
    caller: &Caller,
    _params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    // Correlated subquery keeps the count from multiplying rows.
    let mut stmt = conn
        .prepare(
            "SELECT
               c.id,
               c.name,
               c.section,
               (SELECT COUNT(*) FROM students s
                 WHERE s.class_id = c.id AND s.status = 'active') AS student_count
             FROM classes c
             WHERE c.school_code = ?
             ORDER BY c.name, c.section",
        )
        .map_err(db_query)?;
    let classes = stmt
        .query_map([school], |row| {
            let section: String = row.get(2)?;
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "section": if section.is_empty() { None } else { Some(section) },
                "studentCount": row.get::<_, i64>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(db_query)?;
    Ok(json!({ "classes": classes }))
}

fn classes_create(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let name = required_str(params, "name")?;
    let section = optional_str(params, "section").unwrap_or_default();

    let class_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO classes(id, school_code, name, section, created_at) VALUES(?, ?, ?, ?, ?)",
        (&class_id, school, &name, &section, now_rfc3339()),
    )
    .map_err(|e| {
        if is_unique_violation(&e) {
            HandlerErr::bad_params("class already exists").with_details(json!({ "field": "name" }))
        } else {
            db_write("db_insert_failed", "classes")(e)
        }
    })?;
    audit::record(
        conn,
        AuditEntry {
            school_code: school,
            actor: &caller.actor(),
            action: "classes.create",
            entity: "class",
            entity_id: Some(&class_id),
            details: Some(json!({ "name": name, "section": section })),
        },
    );
    Ok(json!({ "classId": class_id, "name": name }))
}

fn class_in_use() -> HandlerErr {
    HandlerErr::bad_params("class is still referenced by exams, fees or attendance")
}

fn classes_delete(
    conn: &Connection,
    caller: &Caller,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let school = caller.school()?;
    let class_id = required_str(params, "classId")?;
    ensure_exists(conn, "classes", "class", school, &class_id)?;

    let active: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM students WHERE class_id = ? AND status = 'active'",
            [&class_id],
            |r| r.get(0),
        )
        .map_err(db_query)?;
    if active > 0 {
        return Err(HandlerErr::bad_params("class still has active students")
            .with_details(json!({ "activeStudents": active })));
    }

    let referenced: i64 = conn
        .query_row(
            "SELECT (SELECT COUNT(*) FROM attendance WHERE class_id = ?1)
                  + (SELECT COUNT(*) FROM exams WHERE class_id = ?1)
                  + (SELECT COUNT(*) FROM fee_structures WHERE class_id = ?1)",
            [&class_id],
            |r| r.get(0),
        )
        .map_err(db_query)?;
    if referenced > 0 {
        return Err(class_in_use());
    }

    let tx = conn.unchecked_transaction().map_err(db_tx)?;
    // Former members keep their history but lose the dangling link.
    tx.execute(
        "UPDATE students SET class_id = NULL WHERE class_id = ?",
        [&class_id],
    )
    .map_err(db_write("db_update_failed", "students"))?;
    tx.execute("DELETE FROM classes WHERE id = ?", [&class_id])
        .map_err(|e| {
            if is_foreign_key_violation(&e) {
                class_in_use()
            } else {
                db_write("db_delete_failed", "classes")(e)
            }
        })?;
    audit::record(
        &tx,
        AuditEntry {
            school_code: school,
            actor: &caller.actor(),
            action: "classes.delete",
            entity: "class",
            entity_id: Some(&class_id),
            details: None,
        },
    );
    tx.commit().map_err(db_commit)?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request, caller: &Caller) -> Option<serde_json::Value> {
    let handler: Handler = match req.method.as_str() {
        "classes.list" => classes_list,
        "classes.create" => classes_create,
        "classes.delete" => classes_delete,
        _ => return None,
    };
    Some(run(state, req, caller, handler))
}
