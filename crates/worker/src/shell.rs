//! Built-in `shell` executor kind
//!
//! Init params: `[working_dir]` (optional). Method `run(program, args)`
//! spawns the program, waits for it and returns its exit status and
//! output. A non-zero exit fails the call, with the output attached as
//! error details.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tasklane_durable::{ExecutorRegistry, MethodError, MethodTable};
use tokio::process::Command;
use tracing::debug;

/// Executor kind name stored on subtasks
pub const SHELL_KIND: &str = "shell";

/// Captured result of one program run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Exit code; `None` when the program was killed by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Worker state of the `shell` kind
#[derive(Debug, Clone, Default)]
pub struct ShellExecutor {
    working_dir: Option<PathBuf>,
}

impl ShellExecutor {
    pub fn new(working_dir: Option<PathBuf>) -> Self {
        Self { working_dir }
    }

    /// Build from subtask init params
    pub fn from_params(params: &[Value]) -> Result<Self, MethodError> {
        match params.first() {
            None | Some(Value::Null) => Ok(Self::default()),
            Some(Value::String(dir)) => Ok(Self::new(Some(PathBuf::from(dir)))),
            Some(other) => Err(MethodError::invalid_arguments(
                SHELL_KIND,
                format!("working directory must be a string, got {}", other),
            )),
        }
    }

    pub fn working_dir(&self) -> Option<&PathBuf> {
        self.working_dir.as_ref()
    }

    /// Run `program` with `args` to completion
    pub async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, MethodError> {
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        debug!(program, ?args, "running command");
        let output = command.output().await?;
        let result = CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !output.status.success() {
            return Err(MethodError::new(format!("{} exited with {}", program, output.status))
                .with_type("NON_ZERO_EXIT")
                .with_details(serde_json::to_value(&result)?));
        }
        Ok(result)
    }
}

/// Add the `shell` kind to a registry
pub fn register(registry: &mut ExecutorRegistry) {
    registry.register(
        SHELL_KIND,
        ShellExecutor::from_params,
        MethodTable::new().method(
            "run",
            |shell: Arc<ShellExecutor>, (program, args): (String, Vec<String>)| async move {
                shell.run(&program, &args).await
            },
        ),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tasklane_durable::{MethodCall, WorkerExecutor};

    fn executor(params: &[Value]) -> Box<dyn WorkerExecutor> {
        let mut registry = ExecutorRegistry::new();
        register(&mut registry);
        let factory = registry.factory(SHELL_KIND).unwrap();
        factory(params).unwrap()
    }

    #[tokio::test]
    async fn test_run_captures_output() {
        let shell = executor(&[]);
        let result = shell
            .invoke(&MethodCall::new(
                "run",
                vec![json!("sh"), json!(["-c", "echo hello; echo oops >&2"])],
            ))
            .await;

        assert!(!result.failed(), "{}", result.error_message);
        assert_eq!(result.result["status"], json!(0));
        assert_eq!(result.result["stdout"], json!("hello\n"));
        assert_eq!(result.result["stderr"], json!("oops\n"));
    }

    #[tokio::test]
    async fn test_non_zero_exit_fails_the_call() {
        let shell = executor(&[]);
        let result = shell
            .invoke(&MethodCall::new("run", vec![json!("sh"), json!(["-c", "exit 3"])]))
            .await;

        assert!(result.failed());
        let error = result.error.unwrap();
        assert_eq!(error.error_type.as_deref(), Some("NON_ZERO_EXIT"));
        assert_eq!(error.details.unwrap()["status"], json!(3));
    }

    #[tokio::test]
    async fn test_missing_program_is_an_io_error() {
        let shell = executor(&[]);
        let result = shell
            .invoke(&MethodCall::new(
                "run",
                vec![json!("definitely-not-a-real-program"), json!([])],
            ))
            .await;

        assert!(result.failed());
        assert_eq!(result.error.unwrap().error_type.as_deref(), Some("IO"));
    }

    #[tokio::test]
    async fn test_runs_in_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let name = dir.path().file_name().unwrap().to_string_lossy().into_owned();

        let shell = executor(&[json!(dir.path().to_string_lossy())]);
        let result = shell
            .invoke(&MethodCall::new("run", vec![json!("pwd"), json!([])]))
            .await;

        assert!(!result.failed(), "{}", result.error_message);
        let stdout = result.result["stdout"].as_str().unwrap().trim().to_string();
        assert!(stdout.ends_with(&name));
    }

    #[test]
    fn test_init_params_must_be_a_path() {
        assert!(ShellExecutor::from_params(&[]).unwrap().working_dir().is_none());
        let error = ShellExecutor::from_params(&[json!(5)]).unwrap_err();
        assert_eq!(error.error_type.as_deref(), Some("INVALID_ARGUMENTS"));
    }
}
