use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod cmd;

#[derive(Parser)]
#[command(name = "cadence")]
#[command(version, about = "Autonomous coding-agent task orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Project directory holding .cadence/cadence.toml. Defaults to the
    /// current directory.
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Write logs to daily-rolling files in this directory instead of stderr.
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a task through a pipeline on the local queue
    Run {
        /// Task title
        #[arg(long)]
        title: String,

        /// Task description
        #[arg(long, default_value = "")]
        description: String,

        /// Pipeline to execute
        #[arg(long, default_value = "feature_development")]
        pipeline: String,

        /// Workspace directory the agents operate on (defaults to the
        /// project directory)
        #[arg(long)]
        workspace: Option<PathBuf>,

        /// Agent command (receives the prompt on stdin, answers on stdout)
        #[arg(long, env = "CADENCE_AGENT_CMD", default_value = "claude")]
        agent_cmd: String,

        /// Scheduling priority: normal or elevated
        #[arg(long, default_value = "normal")]
        priority: String,

        /// Write a PR summary through the commit lane after a successful run
        #[arg(long)]
        open_pr: bool,
    },
    /// List registered pipelines
    Pipelines,
    /// Show the effective configuration
    Config,
}

fn init_tracing(
    verbose: bool,
    log_dir: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let default_filter = if verbose { "cadence=debug" } else { "cadence=info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "cadence.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.verbose, cli.log_dir.as_deref());

    let project_dir = cli
        .project_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));

    match cli.command {
        Commands::Run {
            title,
            description,
            pipeline,
            workspace,
            agent_cmd,
            priority,
            open_pr,
        } => {
            cmd::run::execute(cmd::run::RunArgs {
                project_dir,
                title,
                description,
                pipeline,
                workspace,
                agent_cmd,
                priority,
                open_pr,
            })
            .await
        }
        Commands::Pipelines => cmd::pipelines::execute(),
        Commands::Config => cmd::config::execute(&project_dir),
    }
}
