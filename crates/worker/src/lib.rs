//! Runner process for tasklane task queues
//!
//! The `tasklane-worker` binary runs one task (`run`), watches the queue and
//! launches a background runner per queued task (`watch`), prints progress
//! (`status`) and provisions the schema (`migrate`).

pub mod commands;
pub mod config;
pub mod shell;
pub mod supervisor;
pub mod telemetry;

pub use commands::{executor_registry, App, OutputFormat};
pub use config::RunnerConfig;
pub use shell::{CommandOutput, ShellExecutor, SHELL_KIND};
pub use supervisor::ProcessSupervisor;
pub use telemetry::{init_telemetry, TelemetryConfig};
