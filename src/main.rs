//! `toolgate`: connect to one MCP server and run a single command against it.

mod logging;

use std::{path::PathBuf, process::ExitCode};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use toolgate_mcp::{ClientConfig, InvocationContext, PrincipalId, SessionId, Supervisor};
use tracing::{info, level_filters::LevelFilter, warn};

#[derive(Parser, Debug)]
#[command(name = "toolgate", version, about = "Resilient MCP tool-invocation client")]
struct Cli {
    /// Path to the YAML or JSON client configuration
    #[arg(long, short = 'c', env = "TOOLGATE_CONFIG")]
    config: PathBuf,

    #[arg(long, global = true, value_enum, default_value = "info", env = "TOOLGATE_LOG_LEVEL")]
    log_level: LogLevel,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the connection status as JSON
    Status,

    /// Exit non-zero unless the server answers a tool listing
    Health,

    /// List the server's tools
    Tools,

    /// Invoke a tool and print the structured result
    Call {
        /// Tool name
        name: String,

        /// Arguments as a JSON object
        #[arg(long, short = 'a', default_value = "{}")]
        args: String,

        /// Principal the call is made on behalf of
        #[arg(long, short = 'p')]
        principal: Option<String>,

        #[arg(long)]
        session: Option<String>,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    logging::init(cli.log_level.into(), cli.json_logs)?;

    let config = ClientConfig::from_file(&cli.config)
        .await
        .with_context(|| format!("loading {}", cli.config.display()))?;
    info!(server_id = %config.server.id, endpoint = %config.server.endpoint, "Loaded configuration");

    let supervisor = Supervisor::new(config)?;
    let connected = supervisor.initialize().await;

    let outcome = run(&supervisor, cli.command, connected.is_ok()).await;

    if let Err(e) = supervisor.shutdown().await {
        warn!(error = %e, "Error during shutdown");
    }
    if let Err(e) = connected {
        warn!(error = %e, "Initial connection failed");
    }
    outcome
}

async fn run(supervisor: &Supervisor, command: Command, connected: bool) -> anyhow::Result<ExitCode> {
    match command {
        Command::Status => {
            print_json(&supervisor.status())?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Health => {
            let healthy = connected && supervisor.health_check().await;
            println!("{}", if healthy { "healthy" } else { "unhealthy" });
            Ok(if healthy { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
        Command::Tools => {
            let tools = supervisor
                .list_tools()
                .await
                .context("listing tools")?;
            print_json(&tools)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Call {
            name,
            args,
            principal,
            session,
        } => {
            let arguments: Value =
                serde_json::from_str(&args).context("--args must be valid JSON")?;
            if !arguments.is_object() {
                bail!("--args must be a JSON object");
            }

            let context = InvocationContext {
                principal_id: principal.map(PrincipalId::new),
                session_id: session.map(SessionId::new),
            };
            let result = supervisor.invoke_tool(&name, arguments, context).await;
            print_json(&result)?;
            Ok(if result.success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
