//! Task processing for the complect build service.
//!
//! Workers claim tasks from the shared PostgreSQL queue, run the compile
//! and deploy pipelines against remote targets, and write results back.
//! A supervisor keeps one worker process per configured spec alive.

pub mod compile;
pub mod context;
pub mod deploy;
pub mod error;
pub mod gateway;
pub mod notify;
pub mod output;
mod pipeline;
pub mod registry;
pub mod retention;
pub mod supervisor;
pub mod worker;

#[cfg(test)]
mod testing;

pub use compile::{CompilePipeline, CompileRequest, CompileRun, Stage};
pub use context::{Stores, WorkerContext};
pub use deploy::{DeployPipeline, DeployRun};
pub use error::{SchedulerError, SchedulerResult};
pub use gateway::GatewayCatalog;
pub use notify::{NoopNotifier, Notifier, WebhookNotifier};
pub use output::{EngineMessage, MessageStatus, TemplateCatalog, parse_engine_output};
pub use pipeline::CapturedError;
pub use registry::{COMPILER_SCRIPT, DEPLOY_SCRIPT, Registry, TaskHandler};
pub use supervisor::Supervisor;
pub use worker::{TaskFailure, Worker, run_worker};
