//! Maintenance jobs: request-log retention and the daily security report.

pub mod report;
pub mod retention;

pub use report::{generate_security_report, SecurityReport};
pub use retention::{cleanup_old_logs, CleanupReport};
