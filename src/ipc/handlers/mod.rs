pub mod academic_years;
pub mod attendance;
pub mod audit_log;
pub mod auth;
pub mod certificates;
pub mod classes;
pub mod core;
pub mod dashboard;
pub mod exams;
pub mod fees;
pub mod gate_passes;
pub mod leave;
pub mod library;
pub mod rbac;
pub mod reports;
pub mod schools;
pub mod staff;
pub mod students;
pub mod transport;
