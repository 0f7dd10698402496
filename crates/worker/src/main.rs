use anyhow::Result;
use clap::{Parser, Subcommand};
use tasklane_worker::{commands, init_telemetry, App, OutputFormat, RunnerConfig, TelemetryConfig};

#[derive(Parser)]
#[command(name = "tasklane-worker")]
#[command(about = "Run, watch and inspect tasklane tasks")]
#[command(version)]
struct Cli {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or update the schema
    Migrate,

    /// Run one task in this process
    Run {
        #[arg(long)]
        task_id: i64,
    },

    /// Put a failed task back into the queue
    Reset {
        #[arg(long)]
        task_id: i64,
    },

    /// Launch a background runner for every queued task until Ctrl-C
    Watch,

    /// Show progress of one or all tasks
    Status {
        #[arg(long)]
        task_id: Option<i64>,

        #[arg(long, short, value_enum, default_value = "text")]
        output: OutputFormat,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Configure via environment variables:
    // - RUST_LOG or LOG_LEVEL: Log filter (default: "tasklane=info")
    init_telemetry(&TelemetryConfig::from_env());

    let cli = Cli::parse();
    let mut config = RunnerConfig::from_env();
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }

    let app = App::connect(config).await?;

    match cli.command {
        Commands::Migrate => commands::migrate(&app).await,
        Commands::Run { task_id } => commands::run(&app, task_id).await,
        Commands::Reset { task_id } => commands::reset(&app, task_id).await,
        Commands::Watch => commands::watch(&app).await,
        Commands::Status { task_id, output } => commands::status(&app, task_id, output).await,
    }
}
