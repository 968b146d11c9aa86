use crate::dates::now_rfc3339;
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

pub const DEFAULT_LIST_LIMIT: i64 = 100;
pub const MAX_LIST_LIMIT: i64 = 500;

#[derive(Debug, Clone)]
pub struct AuditEntry<'a> {
    pub school_code: &'a str,
    pub actor: &'a str,
    pub action: &'a str,
    pub entity: &'a str,
    pub entity_id: Option<&'a str>,
    pub details: Option<serde_json::Value>,
}

/// Appends an audit row. Failures are logged and otherwise ignored so an
/// audit problem never fails the mutation it describes.
pub fn record(conn: &Connection, entry: AuditEntry<'_>) {
    let details = entry.details.as_ref().map(|d| d.to_string());
    let res = conn.execute(
        "INSERT INTO audit_logs(id, school_code, actor, action, entity, entity_id, details, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            Uuid::new_v4().to_string(),
            entry.school_code,
            entry.actor,
            entry.action,
            entry.entity,
            entry.entity_id,
            details,
            now_rfc3339(),
        ),
    );
    if let Err(e) = res {
        tracing::warn!(
            error = %e,
            school = entry.school_code,
            action = entry.action,
            "audit insert failed"
        );
    }
}

pub fn list(
    conn: &Connection,
    school_code: &str,
    entity: Option<&str>,
    limit: i64,
) -> rusqlite::Result<Vec<serde_json::Value>> {
    let limit = limit.clamp(1, MAX_LIST_LIMIT);
    let mut stmt = conn.prepare(
        "SELECT id, actor, action, entity, entity_id, details, created_at
         FROM audit_logs
         WHERE school_code = ?1 AND (?2 IS NULL OR entity = ?2)
         ORDER BY created_at DESC, rowid DESC
         LIMIT ?3",
    )?;
    let rows = stmt
        .query_map((school_code, entity, limit), |r| {
            let details: Option<String> = r.get(5)?;
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "actor": r.get::<_, String>(1)?,
                "action": r.get::<_, String>(2)?,
                "entity": r.get::<_, String>(3)?,
                "entityId": r.get::<_, Option<String>>(4)?,
                "details": details
                    .and_then(|d| serde_json::from_str::<serde_json::Value>(&d).ok())
                    .unwrap_or(serde_json::Value::Null),
                "createdAt": r.get::<_, String>(6)?,
            }))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{memory_db, seed_school};

    fn entry<'a>(school: &'a str, action: &'a str, entity: &'a str) -> AuditEntry<'a> {
        AuditEntry {
            school_code: school,
            actor: "school:AAA",
            action,
            entity,
            entity_id: Some("x1"),
            details: Some(json!({ "k": 1 })),
        }
    }

    #[test]
    fn list_is_newest_first_and_tenant_scoped() {
        let conn = memory_db();
        seed_school(&conn, "AAA");
        record(&conn, entry("AAA", "students.create", "student"));
        record(&conn, entry("AAA", "staff.create", "staff"));
        record(&conn, entry("BBB", "students.create", "student"));

        let all = list(&conn, "AAA", None, DEFAULT_LIST_LIMIT).expect("list");
        assert_eq!(all.len(), 2);
        assert_eq!(all[0]["action"], "staff.create");
        assert_eq!(all[1]["details"]["k"], 1);

        let students = list(&conn, "AAA", Some("student"), 10).expect("list");
        assert_eq!(students.len(), 1);
    }

    #[test]
    fn failed_insert_is_swallowed() {
        let conn = memory_db();
        conn.execute("DROP TABLE audit_logs", []).expect("drop");
        record(&conn, entry("AAA", "noop", "none"));
    }
}
