pub mod command;
pub mod commands;
pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod handler;
pub mod interceptor;
pub mod job_service;
pub mod lock;
pub mod models;
pub mod repository;
pub mod schedule;
pub mod session;

pub use command::{Command, CommandConfig, TxPropagation};
pub use config::EngineConfig;
pub use context::{CloseListener, CommandContext};
pub use error::{EngineError, EngineResult};
pub use executor::{AsyncExecutor, ExecutorHandle};
pub use handler::{HandlerRegistry, JobHandler};
pub use interceptor::CommandExecutor;
pub use job_service::JobService;
pub use lock::LockManager;
pub use models::{Job, JobKind, Lock, NewJob};
pub use repository::{StorageRepository, WriteOp};
pub use schedule::{CronResolver, DueDateResolver};
