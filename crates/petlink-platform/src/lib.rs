pub mod config;
pub mod process;

pub use config::{AppConfig, RunContext};
pub use process::{ProcessSupervisor, TerminationStrategy, WorkerStatus};
