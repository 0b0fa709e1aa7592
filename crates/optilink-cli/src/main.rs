//! Optilink CLI - drive an optimization engine session from the shell.
//!
//! Attaches to a running engine with `--host`/`--port`, or launches a local
//! one from `--executable` (or `OPTILINK_EXECUTABLE`).

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use optilink_core::{OslSession, SessionBuilder};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "optilink")]
#[command(about = "Command-line client for an optimization engine")]
struct Args {
    /// Host of a running engine
    #[arg(long, requires = "port")]
    host: Option<String>,

    /// Port of a running engine
    #[arg(short, long, requires = "host")]
    port: Option<u16>,

    /// Engine executable for a local start
    #[arg(long)]
    executable: Option<PathBuf>,

    /// Project opened by a locally started engine
    #[arg(long)]
    project: Option<PathBuf>,

    /// Server password
    #[arg(long)]
    password: Option<String>,

    /// Default command timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the SERVER_INFO response
    Info,
    /// Print the state of the loaded project
    Status,
    /// Start project execution
    Start {
        /// Return once execution has started
        #[arg(long)]
        wait_started: bool,
        /// Return once execution has finished
        #[arg(long)]
        wait_finished: bool,
    },
    /// Stop project execution
    Stop {
        /// Let designs in progress finish
        #[arg(long)]
        gently: bool,
        /// Return once execution has finished
        #[arg(long)]
        wait_finished: bool,
    },
    /// Shut the engine down
    Shutdown {
        /// Kill a local engine that does not exit on its own
        #[arg(long)]
        force: bool,
    },
    /// Send a raw JSON command or query
    Send {
        /// Command text, e.g. '{"What":"SERVER_IS_ALIVE"}'
        command: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let session = Arc::new(builder(&args).connect().await.context("Cannot open session")?);
    optilink_core::install_interrupt_handler(session.clone())?;

    if let Some(timeout) = args.timeout {
        session.set_timeout(Some(Duration::from_secs(timeout)))?;
    }

    let result = run(&session, args.command).await;
    if !session.is_disposed() {
        session.dispose().await;
    }
    result
}

fn builder(args: &Args) -> SessionBuilder {
    let mut builder = OslSession::builder();
    if let (Some(host), Some(port)) = (&args.host, args.port) {
        builder = builder.host(host.clone()).port(port);
    }
    if let Some(executable) = &args.executable {
        builder = builder.executable(executable);
    }
    if let Some(project) = &args.project {
        builder = builder.project(project);
    }
    if let Some(password) = &args.password {
        builder = builder.password(password.clone());
    }
    builder
}

async fn run(session: &OslSession, command: Command) -> Result<()> {
    match command {
        Command::Info => {
            let info = session.server_info().await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Command::Status => match session.project_status().await? {
            Some(status) => println!("{}", status),
            None => println!("No project loaded"),
        },
        Command::Start {
            wait_started,
            wait_finished,
        } => {
            session.start(wait_started, wait_finished).await?;
            info!("Project started");
        }
        Command::Stop {
            gently,
            wait_finished,
        } => {
            if gently {
                session.stop_gently(wait_finished).await?;
            } else {
                session.stop(wait_finished).await?;
            }
            info!("Stop requested");
        }
        Command::Shutdown { force } => {
            session.shutdown(force).await?;
            info!("Engine shut down");
        }
        Command::Send { command } => {
            let response = session.send_command(&command).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
    }
    Ok(())
}
