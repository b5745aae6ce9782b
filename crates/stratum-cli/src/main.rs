//! Stratum CLI tool.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use stratum_config::ErrorPolicy;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::build::BuildOptions;

#[derive(Parser)]
#[command(name = "stratum")]
#[command(about = "Stratum build scheduler", long_about = None)]
struct Cli {
    /// System configuration file. Defaults apply when it does not exist.
    #[arg(long, global = true, env = "STRATUM_CONFIG", default_value = "stratum.kdl")]
    config: PathBuf,

    /// Build plan file
    #[arg(long, global = true, env = "STRATUM_PLAN", default_value = "stratum.plan.kdl")]
    plan: PathBuf,

    /// Emit log output as JSON
    #[arg(long, global = true, env = "STRATUM_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build elements and everything they depend on
    Build {
        /// Elements to build. Builds every element when empty.
        targets: Vec<String>,
        /// Run track commands before fetching
        #[arg(long)]
        track: bool,
        /// What to do when a job fails
        #[arg(long, value_enum)]
        on_error: Option<OnError>,
        /// Maximum number of jobs running at once
        #[arg(short = 'j', long, env = "STRATUM_MAX_JOBS")]
        max_jobs: Option<usize>,
        /// Dispatch jobs that unblock the most work first
        #[arg(long)]
        unblocking_first: bool,
        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Show the jobs a build would run
    Show {
        /// Elements to show. Shows every element when empty.
        targets: Vec<String>,
        /// Include track jobs
        #[arg(long)]
        track: bool,
    },
    /// Validate the configuration and build plan
    Validate,
}

#[derive(Clone, Copy, ValueEnum)]
enum OnError {
    Continue,
    Quit,
    Terminate,
}

impl From<OnError> for ErrorPolicy {
    fn from(value: OnError) -> Self {
        match value {
            OnError::Continue => ErrorPolicy::Continue,
            OnError::Quit => ErrorPolicy::Quit,
            OnError::Terminate => ErrorPolicy::Terminate,
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = commands::load_system_config(&cli.config)?;
    init_tracing(cli.log_json || config.logging.json);

    match cli.command {
        Commands::Build {
            targets,
            track,
            on_error,
            max_jobs,
            unblocking_first,
            json,
        } => {
            let options = BuildOptions {
                targets,
                track,
                on_error: on_error.map(ErrorPolicy::from),
                max_jobs,
                unblocking_first,
                json,
            };
            let summary = commands::build::run_build(&cli.plan, config, options).await?;
            if !json {
                println!("\n{}", summary);
            }
            if !summary.is_success() {
                anyhow::bail!("Build did not succeed: {}", summary.stop_reason);
            }
        }
        Commands::Show { targets, track } => {
            commands::show(&cli.plan, &config, &targets, track)?;
        }
        Commands::Validate => {
            commands::validate(&cli.plan)?;
        }
    }

    Ok(())
}
