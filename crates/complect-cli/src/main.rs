//! complect command line tool.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "complect")]
#[command(about = "complect build service", long_about = None)]
struct Cli {
    /// System configuration file
    #[arg(long, env = "COMPLECT_CONFIG", default_value = "complect.kdl", global = true)]
    config: PathBuf,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogFormat::Text => "text",
            LogFormat::Json => "json",
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run one worker process per configured spec and keep them alive
    Supervise,
    /// Run a single worker
    Worker {
        /// Worker identity from the worker table
        #[arg(long)]
        name: String,
    },
    /// Apply database migrations
    Migrate,
    /// Validate a configuration file and print its worker table
    Validate {
        /// Path to the configuration file, defaults to --config
        path: Option<PathBuf>,
    },
    /// Add a task to the queue
    Enqueue {
        /// Task type
        #[arg(long = "type")]
        task_type: String,
        /// Script the task runs
        #[arg(long)]
        script: String,
        /// Task arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
    },
    /// List configured compiler and deployer targets
    Targets,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Commands::Supervise => {
            commands::supervise(&cli.config, cli.log_format).await?;
        }
        Commands::Worker { name } => {
            commands::worker(&cli.config, &name).await?;
        }
        Commands::Migrate => {
            commands::migrate(&cli.config).await?;
        }
        Commands::Validate { path } => {
            commands::validate(path.as_deref().unwrap_or(&cli.config))?;
        }
        Commands::Enqueue {
            task_type,
            script,
            args,
        } => {
            commands::enqueue(&cli.config, &task_type, &script, &args).await?;
        }
        Commands::Targets => {
            commands::targets(&cli.config)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_worker_command() {
        let cli = Cli::parse_from(["complect", "--config", "/etc/complect.kdl", "worker", "--name", "compiler-sova"]);
        assert_eq!(cli.config, PathBuf::from("/etc/complect.kdl"));
        assert!(matches!(cli.command, Commands::Worker { ref name } if name == "compiler-sova"));
    }

    #[test]
    fn test_parse_enqueue_command() {
        let cli = Cli::parse_from([
            "complect",
            "enqueue",
            "--type",
            "compiler",
            "--script",
            "scripts.compiler.run",
            "--args",
            r#"{"complect_id":"x"}"#,
            "--log-format",
            "json",
        ]);
        assert_eq!(cli.log_format, LogFormat::Json);
        match cli.command {
            Commands::Enqueue {
                task_type, script, ..
            } => {
                assert_eq!(task_type, "compiler");
                assert_eq!(script, "scripts.compiler.run");
            }
            _ => panic!("expected enqueue"),
        }
    }
}
