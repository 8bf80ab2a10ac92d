//! Repository traits and implementations.

pub mod revision;
pub mod task;

pub use revision::{PgRevisionRepo, RevisionRecord, RevisionRepo, revision_code};
pub use task::{NewTask, PgTaskQueue, RECOVERY_MESSAGE, TaskQueue, recovery_result};
