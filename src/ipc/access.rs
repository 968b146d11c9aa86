//! Request guard: session check, role check, then RBAC for staff sessions.

use crate::dates::now_unix;
use crate::ipc::error::{db_query, HandlerErr};
use crate::ipc::types::{AppState, Caller, Request};
use crate::rbac;
use crate::session::Role;
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permission {
    pub module: &'static str,
    pub sub_module: &'static str,
    pub edit: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    Public,
    Guarded {
        roles: &'static [Role],
        permission: Option<Permission>,
        login_path: &'static str,
    },
}

const ADMIN: &[Role] = &[Role::School];
const ADMIN_TEACHER: &[Role] = &[Role::School, Role::Teacher];
const ADMIN_ACCOUNTANT: &[Role] = &[Role::School, Role::Accountant];
const OFFICE: &[Role] = &[Role::School, Role::Teacher, Role::Accountant];
const ANYONE: &[Role] = &[Role::School, Role::Teacher, Role::Student, Role::Accountant];
const STUDENT: &[Role] = &[Role::Student];

const fn guard(roles: &'static [Role], login_path: &'static str) -> Policy {
    Policy::Guarded {
        roles,
        permission: None,
        login_path,
    }
}

const fn with_perm(
    roles: &'static [Role],
    login_path: &'static str,
    module: &'static str,
    sub_module: &'static str,
    edit: bool,
) -> Policy {
    Policy::Guarded {
        roles,
        permission: Some(Permission {
            module,
            sub_module,
            edit,
        }),
        login_path,
    }
}

const ADMIN_LOGIN: &str = "/login";
const TEACHER_LOGIN: &str = "/teacher/login";
const STUDENT_LOGIN: &str = "/student/login";
const ACCOUNTANT_LOGIN: &str = "/accountant/login";

/// `None` for methods nobody routes; the router answers those itself.
pub fn policy_for(method: &str) -> Option<Policy> {
    let p = match method {
        "health" | "workspace.select" | "schools.register" | "session.login" => Policy::Public,
        "session.whoami" => guard(ANYONE, ADMIN_LOGIN),

        "schools.get" | "schools.update" | "schools.changePassword" => guard(ADMIN, ADMIN_LOGIN),

        "rbac.modules" | "rbac.roles.list" | "rbac.roles.create" | "rbac.roles.delete"
        | "rbac.roles.setPermissions" | "rbac.staff.assignRoles" | "rbac.staff.setOverride"
        | "rbac.staff.clearOverride" | "rbac.check" => guard(ADMIN, ADMIN_LOGIN),

        "academicYears.list" => guard(OFFICE, ADMIN_LOGIN),
        "academicYears.create" | "academicYears.activate" | "academicYears.promote" => {
            guard(ADMIN, ADMIN_LOGIN)
        }

        "classes.list" => guard(OFFICE, ADMIN_LOGIN),
        "classes.create" | "classes.delete" => guard(ADMIN, ADMIN_LOGIN),

        "students.list" | "students.get" => with_perm(OFFICE, ADMIN_LOGIN, "students", "records", false),
        "students.create" | "students.update" | "students.delete" | "students.setPassword" => {
            with_perm(ADMIN_TEACHER, ADMIN_LOGIN, "students", "records", true)
        }
        "students.setPhoto" => with_perm(ADMIN_TEACHER, ADMIN_LOGIN, "students", "photos", true),
        "portal.me" => guard(STUDENT, STUDENT_LOGIN),

        "staff.list" | "staff.get" | "staff.create" | "staff.update" | "staff.delete"
        | "staff.setPassword" => guard(ADMIN, ADMIN_LOGIN),

        "attendance.mark" => with_perm(ADMIN_TEACHER, TEACHER_LOGIN, "attendance", "daily", true),
        "attendance.day" => with_perm(ADMIN_TEACHER, TEACHER_LOGIN, "attendance", "daily", false),
        "attendance.summary" => with_perm(ADMIN_TEACHER, TEACHER_LOGIN, "attendance", "reports", false),

        "fees.structures.list" => {
            with_perm(ADMIN_ACCOUNTANT, ACCOUNTANT_LOGIN, "fees", "structures", false)
        }
        "fees.structures.create" | "fees.assign" => {
            with_perm(ADMIN_ACCOUNTANT, ACCOUNTANT_LOGIN, "fees", "structures", true)
        }
        "fees.student" | "fees.defaulters" => {
            with_perm(ADMIN_ACCOUNTANT, ACCOUNTANT_LOGIN, "fees", "collection", false)
        }
        "fees.pay" => with_perm(ADMIN_ACCOUNTANT, ACCOUNTANT_LOGIN, "fees", "collection", true),

        "library.books.list" => with_perm(ADMIN_TEACHER, TEACHER_LOGIN, "library", "catalogue", false),
        "library.books.create" | "library.books.update" | "library.books.delete" => {
            with_perm(ADMIN_TEACHER, TEACHER_LOGIN, "library", "catalogue", true)
        }
        "library.loans" => with_perm(ADMIN_TEACHER, TEACHER_LOGIN, "library", "circulation", false),
        "library.issue" | "library.return" => {
            with_perm(ADMIN_TEACHER, TEACHER_LOGIN, "library", "circulation", true)
        }

        "transport.routes.list" | "transport.roster" => {
            with_perm(ADMIN_TEACHER, TEACHER_LOGIN, "transport", "routes", false)
        }
        "transport.routes.create" | "transport.routes.delete" | "transport.assign"
        | "transport.unassign" => guard(ADMIN, ADMIN_LOGIN),

        "exams.list" | "exams.results" => with_perm(ADMIN_TEACHER, TEACHER_LOGIN, "exams", "results", false),
        "exams.create" => with_perm(ADMIN_TEACHER, TEACHER_LOGIN, "exams", "setup", true),
        "exams.recordMarks" => with_perm(ADMIN_TEACHER, TEACHER_LOGIN, "exams", "marks", true),

        "certificates.issue" | "certificates.bulkIssue" | "certificates.list"
        | "certificates.revoke" => guard(ADMIN, ADMIN_LOGIN),

        "leave.request" | "leave.list" => guard(ADMIN_TEACHER, TEACHER_LOGIN),
        "leave.decide" => guard(ADMIN, ADMIN_LOGIN),

        "gatePasses.issue" => with_perm(ADMIN_TEACHER, TEACHER_LOGIN, "gate_pass", "passes", true),
        "gatePasses.list" => with_perm(ADMIN_TEACHER, TEACHER_LOGIN, "gate_pass", "passes", false),

        "reports.export" => with_perm(ADMIN_ACCOUNTANT, ADMIN_LOGIN, "reports", "exports", false),

        "dashboard.stats" | "audit.list" => guard(ADMIN, ADMIN_LOGIN),

        _ => return None,
    };
    Some(p)
}

pub fn authorize(state: &AppState, req: &Request) -> Result<Caller, HandlerErr> {
    let now = now_unix();
    let Some(policy) = policy_for(&req.method) else {
        return Ok(Caller::anonymous());
    };
    let (roles, permission, login_path) = match policy {
        Policy::Public => {
            // A stale token on a public call is simply ignored.
            let session = req
                .session
                .as_deref()
                .and_then(|t| state.sessions.verify(t, now).ok());
            return Ok(Caller { session });
        }
        Policy::Guarded {
            roles,
            permission,
            login_path,
        } => (roles, permission, login_path),
    };

    let unauthenticated = |message: String| {
        HandlerErr::new("unauthenticated", message).with_details(json!({ "loginPath": login_path }))
    };
    let Some(token) = req.session.as_deref() else {
        return Err(unauthenticated("sign in first".to_string()));
    };
    let session = state
        .sessions
        .verify(token, now)
        .map_err(|e| unauthenticated(e.to_string()))?;

    if !roles.contains(&session.role) {
        return Err(HandlerErr::forbidden(format!(
            "{} may not call {}",
            session.role_tag(),
            req.method
        ))
        .with_details(json!({ "loginPath": login_path })));
    }

    if let Some(perm) = permission {
        if matches!(session.role, Role::Teacher | Role::Accountant) {
            let conn = state
                .db
                .as_ref()
                .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))?;
            let resolution = rbac::resolve(
                conn,
                &session.school_code,
                &session.subject_id,
                perm.module,
                perm.sub_module,
            )
            .map_err(db_query)?;
            if !resolution.allows(perm.edit) {
                return Err(HandlerErr::forbidden("permission denied").with_details(json!({
                    "module": perm.module,
                    "subModule": perm.sub_module,
                    "access": if perm.edit { "edit" } else { "view" },
                })));
            }
        }
    }

    Ok(Caller {
        session: Some(session),
    })
}
