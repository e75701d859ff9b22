//! runway CLI: the scheduler daemon and operator commands.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod commands;

#[derive(Parser)]
#[command(name = "runway")]
#[command(about = "runway CI job scheduler", long_about = None)]
struct Cli {
    /// Scheduler configuration file
    #[arg(long, short, env = "RUNWAY_CONFIG", default_value = "runway.kdl")]
    config: PathBuf,

    /// Database URL; overrides the configuration file
    #[arg(long, env = "RUNWAY_DATABASE_URL")]
    database_url: Option<String>,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler loop until interrupted
    Scheduler,
    /// Apply database migrations
    Migrate,
    /// Validate a scheduler configuration or a job tree
    Validate {
        /// Path to the file
        path: PathBuf,
        /// Treat the file as a job tree instead of scheduler configuration
        #[arg(long)]
        job_tree: bool,
    },
    /// Submit a job tree as a new run
    Submit {
        /// Path to the job tree file
        path: PathBuf,
    },
    /// Manage workflows
    Workflows {
        #[command(subcommand)]
        command: WorkflowCommands,
    },
    /// Inspect and cancel runs
    Runs {
        #[command(subcommand)]
        command: RunCommands,
    },
    /// Re-run or enqueue jobs
    Jobs {
        #[command(subcommand)]
        command: JobCommands,
    },
    /// Show the live dispatch queue
    Queue,
}

#[derive(Subcommand)]
enum WorkflowCommands {
    /// Register a workflow definition path for a repository
    Register {
        /// Repository ID
        repository: Uuid,
        /// Path of the workflow definition within the repository
        path: String,
    },
    /// Allow new runs of a workflow
    Enable { id: Uuid },
    /// Reject new runs of a workflow
    Disable { id: Uuid },
    /// Delete a workflow with all of its runs
    Delete { id: Uuid },
}

#[derive(Subcommand)]
enum RunCommands {
    /// List recent runs of a repository
    List {
        /// Repository ID
        repository: Uuid,
        /// Maximum number of runs to show
        #[arg(long, default_value = "20")]
        limit: i64,
    },
    /// Show a run with its jobs and steps
    Show { id: Uuid },
    /// Cancel a run
    Cancel { id: Uuid },
}

#[derive(Subcommand)]
enum JobCommands {
    /// Re-run a job that did not succeed, with its dependents
    Retry { id: Uuid },
    /// Put a job back on the dispatch queue
    Enqueue {
        id: Uuid,
        #[arg(long, default_value = "0")]
        priority: i32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    // Validation works without a database.
    if let Commands::Validate { path, job_tree } = &cli.command {
        return commands::validate(path, *job_tree);
    }

    let config = commands::load_config(&cli.config, cli.database_url.clone())?;
    let ctx = commands::Context::connect(config).await?;

    match cli.command {
        Commands::Scheduler => commands::scheduler::run(&ctx).await?,
        Commands::Migrate => commands::migrate(&ctx).await?,
        Commands::Validate { .. } => {}
        Commands::Submit { path } => commands::runs::submit(&ctx, &path).await?,
        Commands::Workflows { command } => match command {
            WorkflowCommands::Register { repository, path } => {
                commands::workflows::register(&ctx, repository, &path).await?;
            }
            WorkflowCommands::Enable { id } => {
                commands::workflows::set_enabled(&ctx, id, true).await?;
            }
            WorkflowCommands::Disable { id } => {
                commands::workflows::set_enabled(&ctx, id, false).await?;
            }
            WorkflowCommands::Delete { id } => commands::workflows::delete(&ctx, id).await?,
        },
        Commands::Runs { command } => match command {
            RunCommands::List { repository, limit } => {
                commands::runs::list(&ctx, repository, limit).await?;
            }
            RunCommands::Show { id } => commands::runs::show(&ctx, id).await?,
            RunCommands::Cancel { id } => commands::runs::cancel(&ctx, id).await?,
        },
        Commands::Jobs { command } => match command {
            JobCommands::Retry { id } => commands::jobs::retry(&ctx, id).await?,
            JobCommands::Enqueue { id, priority } => {
                commands::jobs::enqueue(&ctx, id, priority).await?;
            }
        },
        Commands::Queue => commands::scheduler::queue(&ctx).await?,
    }

    Ok(())
}
