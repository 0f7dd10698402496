//! Launch runners as detached background processes

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tasklane_durable::{Supervisor, SupervisorError};
use tokio::process::Command;
use tracing::info;

/// Re-launches `<program> run --task-id N` in the background
///
/// Children inherit the parent's environment. A database URL given on the
/// parent's command line is handed down as `DATABASE_URL`, so every runner
/// talks to the same database as the process that launched it.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    program: PathBuf,
    low_priority: bool,
    database_url: Option<String>,
}

impl ProcessSupervisor {
    pub fn new(program: impl Into<PathBuf>, low_priority: bool) -> Self {
        Self {
            program: program.into(),
            low_priority,
            database_url: None,
        }
    }

    /// Database the launched runners connect to
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    /// Supervisor launching the currently running executable
    pub fn current_exe(low_priority: bool) -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, low_priority))
    }

    /// Program and arguments used to run `task_id`
    pub fn command_line(&self, task_id: i64) -> Vec<OsString> {
        let mut line = Vec::new();
        if self.low_priority {
            line.extend(["nice", "-n", "19"].map(OsString::from));
        }
        line.push(self.program.clone().into_os_string());
        line.extend(["run", "--task-id"].map(OsString::from));
        line.push(OsString::from(task_id.to_string()));
        line
    }

    /// Detached command for `task_id`, environment included
    pub fn command(&self, task_id: i64) -> Option<Command> {
        let line = self.command_line(task_id);
        let (program, args) = line.split_first()?;

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(url) = &self.database_url {
            command.env("DATABASE_URL", url);
        }
        Some(command)
    }
}

#[async_trait]
impl Supervisor for ProcessSupervisor {
    async fn launch(&self, task_id: i64) -> Result<(), SupervisorError> {
        let mut command = self.command(task_id).ok_or_else(|| SupervisorError::LaunchFailed {
            task_id,
            message: "empty command line".to_string(),
        })?;

        let child = command.spawn().map_err(|e| SupervisorError::LaunchFailed {
            task_id,
            message: e.to_string(),
        })?;

        info!(task_id, pid = child.id(), low_priority = self.low_priority, "runner launched");
        Ok(())
    }
}
