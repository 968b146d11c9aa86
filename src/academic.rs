//! Academic-year activation and class promotion.
//!
//! Both workflows touch several rows and run inside a single transaction:
//! either every step lands or none does.

use crate::audit::{self, AuditEntry};
use crate::dates::now_rfc3339;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum AcademicError {
    #[error("academic year not found")]
    YearNotFound,
    #[error("academic year is already current")]
    AlreadyCurrent,
    #[error("class not found: {0}")]
    ClassNotFound(String),
    #[error("source and target class are the same")]
    SameClass,
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activation {
    pub activated_id: String,
    pub closed_id: Option<String>,
}

pub fn activate_year(
    conn: &Connection,
    school_code: &str,
    year_id: &str,
    actor: &str,
) -> Result<Activation, AcademicError> {
    let tx = conn.unchecked_transaction()?;

    let is_current: Option<i64> = tx
        .query_row(
            "SELECT is_current FROM academic_years WHERE school_code = ? AND id = ?",
            (school_code, year_id),
            |r| r.get(0),
        )
        .optional()?;
    match is_current {
        None => return Err(AcademicError::YearNotFound),
        Some(1) => return Err(AcademicError::AlreadyCurrent),
        Some(_) => {}
    }

    let closed_id: Option<String> = tx
        .query_row(
            "SELECT id FROM academic_years WHERE school_code = ? AND is_current = 1",
            [school_code],
            |r| r.get(0),
        )
        .optional()?;
    if let Some(prev) = closed_id.as_deref() {
        tx.execute(
            "UPDATE academic_years SET status = 'closed' WHERE id = ?",
            [prev],
        )?;
    }
    tx.execute(
        "UPDATE academic_years SET is_current = 0 WHERE school_code = ?",
        [school_code],
    )?;
    tx.execute(
        "UPDATE academic_years SET is_current = 1, status = 'active' WHERE id = ?",
        [year_id],
    )?;
    tx.execute(
        "UPDATE schools SET current_academic_year_id = ? WHERE code = ?",
        (year_id, school_code),
    )?;
    audit::record(
        &tx,
        AuditEntry {
            school_code,
            actor,
            action: "academicYears.activate",
            entity: "academic_year",
            entity_id: Some(year_id),
            details: Some(json!({ "closedYearId": closed_id })),
        },
    );
    tx.commit()?;

    Ok(Activation {
        activated_id: year_id.to_string(),
        closed_id,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromotionTarget {
    Class(String),
    Graduate,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Promotion {
    pub moved: Vec<String>,
    pub skipped: Vec<String>,
}

fn class_exists(conn: &Connection, school_code: &str, class_id: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM classes WHERE school_code = ? AND id = ?",
        (school_code, class_id),
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
}

/// Moves active students out of `from_class`. With `student_ids` only those
/// students are considered; ids that are not active members of the class are
/// reported as skipped.
pub fn promote_students(
    conn: &Connection,
    school_code: &str,
    from_class: &str,
    target: &PromotionTarget,
    student_ids: Option<&[String]>,
    academic_year_id: Option<&str>,
    actor: &str,
) -> Result<Promotion, AcademicError> {
    if !class_exists(conn, school_code, from_class)? {
        return Err(AcademicError::ClassNotFound(from_class.to_string()));
    }
    if let PromotionTarget::Class(to) = target {
        if to == from_class {
            return Err(AcademicError::SameClass);
        }
        if !class_exists(conn, school_code, to)? {
            return Err(AcademicError::ClassNotFound(to.clone()));
        }
    }

    let members: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT id FROM students
             WHERE school_code = ? AND class_id = ? AND status = 'active'
             ORDER BY last_name, first_name",
        )?;
        let rows = stmt.query_map((school_code, from_class), |r| r.get::<_, String>(0))?;
        rows.collect::<Result<Vec<_>, _>>()?
    };

    let mut out = Promotion::default();
    let selected: Vec<String> = match student_ids {
        Some(ids) => {
            for id in ids {
                if !members.contains(id) {
                    out.skipped.push(id.clone());
                }
            }
            ids.iter().filter(|id| members.contains(id)).cloned().collect()
        }
        None => members,
    };

    let (to_class, outcome) = match target {
        PromotionTarget::Class(to) => (Some(to.as_str()), "promoted"),
        PromotionTarget::Graduate => (None, "graduated"),
    };
    let now = now_rfc3339();
    let tx = conn.unchecked_transaction()?;
    for student_id in &selected {
        match to_class {
            Some(to) => tx.execute(
                "UPDATE students SET class_id = ?, updated_at = ? WHERE id = ?",
                (to, &now, student_id),
            )?,
            None => tx.execute(
                "UPDATE students SET status = 'graduated', updated_at = ? WHERE id = ?",
                (&now, student_id),
            )?,
        };
        tx.execute(
            "INSERT INTO student_class_history(id, school_code, student_id, from_class_id, to_class_id, academic_year_id, outcome, moved_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                school_code,
                student_id,
                from_class,
                to_class,
                academic_year_id,
                outcome,
                &now,
            ),
        )?;
        out.moved.push(student_id.clone());
    }
    audit::record(
        &tx,
        AuditEntry {
            school_code,
            actor,
            action: "academicYears.promote",
            entity: "class",
            entity_id: Some(from_class),
            details: Some(json!({
                "toClassId": to_class,
                "outcome": outcome,
                "moved": out.moved.len(),
                "skipped": out.skipped.len(),
            })),
        },
    );
    tx.commit()?;
    Ok(out)
}
