//! Staff permission resolution.
//!
//! An individual override row for (staff, module, sub-module) always wins,
//! including an override that denies. Without one, the staff member's roles
//! are checked in role-name order and the first grant found is used.

use rusqlite::{Connection, OptionalExtension};

/// Known modules and their sub-modules.
pub const MODULES: &[(&str, &[&str])] = &[
    ("students", &["records", "photos"]),
    ("attendance", &["daily", "reports"]),
    ("fees", &["structures", "collection"]),
    ("library", &["catalogue", "circulation"]),
    ("transport", &["routes"]),
    ("exams", &["setup", "marks", "results"]),
    ("gate_pass", &["passes"]),
    ("reports", &["exports"]),
];

pub fn is_known(module: &str, sub_module: &str) -> bool {
    MODULES
        .iter()
        .any(|(m, subs)| *m == module && subs.contains(&sub_module))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Override,
    Role,
    None,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Source::Override => "override",
            Source::Role => "role",
            Source::None => "none",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub can_view: bool,
    pub can_edit: bool,
    pub source: Source,
    pub role_id: Option<String>,
}

impl Resolution {
    fn none() -> Self {
        Self {
            can_view: false,
            can_edit: false,
            source: Source::None,
            role_id: None,
        }
    }

    /// Edit access implies view access.
    pub fn allows(&self, need_edit: bool) -> bool {
        if need_edit {
            self.can_edit
        } else {
            self.can_view || self.can_edit
        }
    }
}

pub fn resolve(
    conn: &Connection,
    school_code: &str,
    staff_id: &str,
    module: &str,
    sub_module: &str,
) -> rusqlite::Result<Resolution> {
    let over: Option<(i64, i64)> = conn
        .query_row(
            "SELECT sp.can_view, sp.can_edit
             FROM staff_permissions sp
             JOIN staff s ON s.id = sp.staff_id
             WHERE s.school_code = ? AND sp.staff_id = ? AND sp.module = ? AND sp.sub_module = ?",
            (school_code, staff_id, module, sub_module),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    if let Some((can_view, can_edit)) = over {
        return Ok(Resolution {
            can_view: can_view != 0,
            can_edit: can_edit != 0,
            source: Source::Override,
            role_id: None,
        });
    }

    let mut stmt = conn.prepare(
        "SELECT r.id, rp.can_view, rp.can_edit
         FROM staff_roles sr
         JOIN roles r ON r.id = sr.role_id
         JOIN role_permissions rp ON rp.role_id = r.id
         WHERE r.school_code = ? AND sr.staff_id = ? AND rp.module = ? AND rp.sub_module = ?
         ORDER BY r.name",
    )?;
    let grants = stmt
        .query_map((school_code, staff_id, module, sub_module), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, i64>(1)? != 0,
                r.get::<_, i64>(2)? != 0,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let first_grant = grants.into_iter().find(|(_, view, edit)| *view || *edit);
    Ok(match first_grant {
        Some((role_id, can_view, can_edit)) => Resolution {
            can_view,
            can_edit,
            source: Source::Role,
            role_id: Some(role_id),
        },
        None => Resolution::none(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{memory_db, seed_school};

    fn seed_staff(conn: &Connection, school: &str, id: &str) {
        conn.execute(
            "INSERT INTO staff(id, school_code, employee_code, first_name, last_name, role_kind, created_at)
             VALUES(?, ?, ?, 'T', 'Teacher', 'teacher', 'now')",
            (id, school, format!("E-{}", id)),
        )
        .expect("seed staff");
    }

    fn seed_role(conn: &Connection, school: &str, id: &str, name: &str, grant: (bool, bool)) {
        conn.execute(
            "INSERT INTO roles(id, school_code, name, created_at) VALUES(?, ?, ?, 'now')",
            (id, school, name),
        )
        .expect("seed role");
        conn.execute(
            "INSERT INTO role_permissions(role_id, module, sub_module, can_view, can_edit)
             VALUES(?, 'library', 'circulation', ?, ?)",
            (id, grant.0 as i64, grant.1 as i64),
        )
        .expect("seed grant");
    }

    fn assign(conn: &Connection, staff: &str, role: &str) {
        conn.execute(
            "INSERT INTO staff_roles(staff_id, role_id) VALUES(?, ?)",
            (staff, role),
        )
        .expect("assign");
    }

    #[test]
    fn no_grants_means_no_access() {
        let conn = memory_db();
        seed_school(&conn, "AAA");
        seed_staff(&conn, "AAA", "s1");
        let r = resolve(&conn, "AAA", "s1", "library", "circulation").expect("resolve");
        assert_eq!(r.source, Source::None);
        assert!(!r.allows(false));
    }

    #[test]
    fn role_grant_applies_in_name_order() {
        let conn = memory_db();
        seed_school(&conn, "AAA");
        seed_staff(&conn, "AAA", "s1");
        seed_role(&conn, "AAA", "r-z", "Zeta", (true, true));
        seed_role(&conn, "AAA", "r-a", "Alpha", (true, false));
        assign(&conn, "s1", "r-z");
        assign(&conn, "s1", "r-a");
        let r = resolve(&conn, "AAA", "s1", "library", "circulation").expect("resolve");
        assert_eq!(r.source, Source::Role);
        assert_eq!(r.role_id.as_deref(), Some("r-a"));
        assert!(r.allows(false));
        assert!(!r.allows(true));
    }

    #[test]
    fn override_wins_over_role_even_when_denying() {
        let conn = memory_db();
        seed_school(&conn, "AAA");
        seed_staff(&conn, "AAA", "s1");
        seed_role(&conn, "AAA", "r1", "Librarian", (true, true));
        assign(&conn, "s1", "r1");
        conn.execute(
            "INSERT INTO staff_permissions(staff_id, module, sub_module, can_view, can_edit)
             VALUES('s1', 'library', 'circulation', 0, 0)",
            [],
        )
        .expect("override");
        let r = resolve(&conn, "AAA", "s1", "library", "circulation").expect("resolve");
        assert_eq!(r.source, Source::Override);
        assert!(!r.allows(false));
    }

    #[test]
    fn other_tenants_staff_never_resolve() {
        let conn = memory_db();
        seed_school(&conn, "AAA");
        seed_school(&conn, "BBB");
        seed_staff(&conn, "BBB", "s9");
        seed_role(&conn, "BBB", "r9", "Librarian", (true, true));
        assign(&conn, "s9", "r9");
        let r = resolve(&conn, "AAA", "s9", "library", "circulation").expect("resolve");
        assert_eq!(r.source, Source::None);
    }

    #[test]
    fn catalogue_lookup() {
        assert!(is_known("fees", "collection"));
        assert!(!is_known("fees", "refunds"));
        assert!(!is_known("canteen", "orders"));
    }
}
