//! Command handlers of the runner binary

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tasklane_durable::{
    ExecutorRegistry, FileLockProvider, LogNotifier, PostgresTaskStore, Progress, RunReport,
    Runner, Task, TaskQueue, TaskStatus,
};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::RunnerConfig;
use crate::shell;
use crate::supervisor::ProcessSupervisor;

/// Output format of `status`
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Executor kinds this binary can run
pub fn executor_registry() -> ExecutorRegistry {
    let mut registry = ExecutorRegistry::new();
    shell::register(&mut registry);
    registry
}

/// Connected runner context
pub struct App {
    config: RunnerConfig,
    queue: TaskQueue,
}

impl App {
    pub async fn connect(config: RunnerConfig) -> Result<Self> {
        let store = PostgresTaskStore::connect(&config.database_url)
            .await
            .context("Failed to connect to PostgreSQL")?;
        let locks = FileLockProvider::new(config.lock_dir.clone())
            .with_context(|| format!("Failed to prepare lock dir {}", config.lock_dir.display()))?;

        let queue = TaskQueue::new(
            Arc::new(store),
            Arc::new(locks),
            Arc::new(executor_registry()),
            config.engine.clone(),
        );
        Ok(Self { config, queue })
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    fn runner(&self) -> Result<Runner> {
        let supervisor = ProcessSupervisor::current_exe(self.config.low_priority)
            .context("Failed to resolve the runner executable")?
            .with_database_url(self.config.database_url.clone());
        Ok(Runner::new(
            self.queue.clone(),
            Arc::new(LogNotifier),
            Arc::new(supervisor),
            self.config.runner_options(),
        ))
    }
}

pub async fn migrate(app: &App) -> Result<()> {
    app.queue
        .store()
        .migrate()
        .await
        .context("Failed to run migrations")?;
    info!("migrations applied");
    Ok(())
}

pub async fn run(app: &App, task_id: i64) -> Result<()> {
    let report = app
        .runner()?
        .run_now(task_id)
        .await
        .with_context(|| format!("Task {} aborted", task_id))?;

    match report {
        RunReport::Done => Ok(()),
        RunReport::AlreadyRunning => {
            info!(task_id, "task is already being run elsewhere");
            Ok(())
        }
        RunReport::NotFound => bail!("task {} not found", task_id),
        RunReport::Refused => bail!("task {} failed before; reset it to run it again", task_id),
        RunReport::Failed => bail!("task {} failed", task_id),
    }
}

pub async fn reset(app: &App, task_id: i64) -> Result<()> {
    let Some(mut task) = app.queue.load(task_id).await? else {
        bail!("task {} not found", task_id);
    };
    task.reset().await?;
    info!(task_id, "task reset");
    Ok(())
}

/// Launch runners for queued tasks until Ctrl-C
pub async fn watch(app: &App) -> Result<()> {
    let runner = app.runner()?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal");
                shutdown_tx.send_replace(true);
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for Ctrl-C, watching until killed");
                // Dropping the sender would stop the watch loop
                std::future::pending::<()>().await;
                drop(shutdown_tx);
            }
        }
    });

    runner.watch(shutdown_rx).await?;
    Ok(())
}

/// One line of `status`
#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub id: i64,
    pub name: String,
    pub project_name: String,
    pub status: TaskStatus,
    pub time_added: DateTime<Utc>,
    pub progress: Progress,
}

impl TaskSummary {
    async fn collect(task: &Task) -> Result<Self> {
        Ok(Self {
            id: task.id(),
            name: task.name().to_string(),
            project_name: task.project_name().to_string(),
            status: task.status(),
            time_added: task.time_added(),
            progress: task.progress().await?,
        })
    }

    fn to_line(&self) -> String {
        let mut line = format!(
            "{:>6}  {:<10}  {:>3}%  eta {:<10}  {}",
            self.id,
            self.status.as_str(),
            self.progress.percent,
            format_eta(self.progress.estimated_seconds_remaining),
            self.name
        );
        if !self.progress.description.is_empty() {
            line.push_str(&format!("  [{}]", self.progress.description));
        }
        line
    }
}

pub async fn status(app: &App, task_id: Option<i64>, format: OutputFormat) -> Result<()> {
    let tasks = match task_id {
        Some(id) => match app.queue.load(id).await? {
            Some(task) => vec![task],
            None => bail!("task {} not found", id),
        },
        None => app.queue.load_all().await?,
    };

    let mut summaries = Vec::with_capacity(tasks.len());
    for task in &tasks {
        summaries.push(TaskSummary::collect(task).await?);
    }

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summaries)?),
        OutputFormat::Text => {
            if summaries.is_empty() {
                println!("no tasks");
            }
            for summary in &summaries {
                println!("{}", summary.to_line());
            }
        }
    }
    Ok(())
}

/// Human form of an ETA in seconds; negative means unknown
pub fn format_eta(seconds: i64) -> String {
    if seconds < 0 {
        return "unknown".to_string();
    }
    let (hours, rest) = (seconds / 3600, seconds % 3600);
    let (minutes, seconds) = (rest / 60, rest % 60);
    if hours > 0 {
        format!("{}h{:02}m{:02}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m{:02}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
