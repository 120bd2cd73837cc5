#![forbid(unsafe_code)]

//! `agent-loopctl` is the command-line companion for `agent-loopd`.
//!
//! Reads and updates the session registry directly, talks to session
//! control sockets, and reaches remote daemons over the overlay.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::{fmt, EnvFilter};

use agent_loopd::config::GlobalConfig;
use agent_loopd::ipc::RpcClient;
use agent_loopd::models::session::SessionRecord;
use agent_loopd::multiplexer::{shell_quote, Multiplexer, Tmux};
use agent_loopd::orchestrator::lifecycle::{
    AttachTarget, RemoteAccess, SessionLifecycle, TerminalStart,
};
use agent_loopd::overlay::remote::{require_identity, StartSessionParams};
use agent_loopd::overlay::{DirectoryOverlay, LocalForwarder, OverlayNetwork};
use agent_loopd::persistence::db;
use agent_loopd::persistence::session_repo::SessionRegistry;
use agent_loopd::{AppError, Result};

#[derive(Debug, Parser)]
#[command(
    name = "agent-loopctl",
    about = "Control agent loop sessions",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML configuration file shared with the daemon.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the data directory.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start a terminal-mode session in a detached multiplexer session.
    Start {
        /// Task directory.
        task_dir: PathBuf,
        /// Task name; defaults to the directory name.
        #[arg(long)]
        task: Option<String>,
        /// Agent driving the loop.
        #[arg(long, default_value = "opencode")]
        agent: String,
        /// Iteration cap.
        #[arg(long, default_value_t = 50)]
        max_iterations: u32,
        /// Driver command; defaults to the configured driver.
        #[arg(last = true)]
        command: Vec<String>,
    },

    /// List sessions.
    Status {
        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
        /// Ask remote daemons about overlay sessions first.
        #[arg(long)]
        remote: bool,
    },

    /// Stop a running session.
    Stop {
        /// Task name.
        task: String,
    },

    /// Ask a running session to checkpoint after its current iteration.
    Checkpoint {
        /// Task name.
        task: String,
    },

    /// Attach the terminal to a session.
    Attach {
        /// Task name.
        task: String,
    },

    /// Remove finished sessions.
    Clean {
        /// Also remove running sessions.
        #[arg(long)]
        all: bool,
    },

    /// Sessions on remote daemons.
    Remote {
        #[command(subcommand)]
        command: RemoteCommand,
    },

    /// Talk to a session's control socket.
    Rpc {
        /// Task name.
        task: String,
        #[command(subcommand)]
        command: RpcCommand,
    },
}

#[derive(Debug, Subcommand)]
enum RemoteCommand {
    /// Refresh and print overlay sessions.
    Status,
    /// Start an agent-server session on a remote host.
    Start {
        /// Remote host name.
        host: String,
        /// Task directory on the remote host.
        task_dir: String,
        /// Task name; defaults to the directory name.
        #[arg(long)]
        task: Option<String>,
        /// Agent driving the loop.
        #[arg(long, default_value = "opencode")]
        agent: String,
        /// Iteration cap.
        #[arg(long, default_value_t = 50)]
        max_iterations: i64,
        /// Model override.
        #[arg(long)]
        model: Option<String>,
    },
    /// Stop a remote session.
    Stop {
        /// Task name.
        task: String,
    },
}

#[derive(Debug, Subcommand)]
enum RpcCommand {
    /// Print the session state.
    Status,
    /// Switch interactive mode on or off.
    Interactive {
        /// `on` or `off`.
        state: String,
    },
    /// Forward text to the agent's terminal (interactive mode only).
    Write {
        /// Text to write.
        data: String,
    },
    /// Queue a prompt for the next iteration.
    Inject {
        /// Prompt text.
        prompt: String,
    },
    /// Stream events until interrupted.
    Watch {
        /// Event names; defaults to every event.
        #[arg(long, value_delimiter = ',', default_value = "*")]
        events: Vec<String>,
    },
}

fn main() -> ExitCode {
    let args = Cli::parse();
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("Error: failed to build tokio runtime: {err}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(args)) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Cli) -> Result<ExitCode> {
    let mut config = match &args.config {
        Some(path) => GlobalConfig::load_from_path(path)?,
        None => GlobalConfig::default(),
    };
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }

    let registry = SessionRegistry::new(Arc::new(db::connect(config.db_path()).await?));
    let multiplexer = Arc::new(Tmux::new(&config.multiplexer));
    let network: Arc<dyn OverlayNetwork> = Arc::new(DirectoryOverlay);
    let lifecycle = SessionLifecycle::new(
        &config,
        registry,
        Arc::clone(&multiplexer) as Arc<dyn Multiplexer>,
        reqwest::Client::new(),
    )
    .with_remote(RemoteAccess {
        network: Arc::clone(&network),
        control_service_prefix: config.overlay.control_service_prefix.clone(),
        default_identity: config.overlay.identity_path.clone(),
        timeout: config.timeouts.http(),
    });

    match args.command {
        Command::Start {
            task_dir,
            task,
            agent,
            max_iterations,
            command,
        } => {
            let task_dir = task_dir.canonicalize().map_err(|err| {
                AppError::Config(format!("invalid task directory {}: {err}", task_dir.display()))
            })?;
            let task_name = task.unwrap_or_else(|| default_task_name(&task_dir));
            let command = driver_command(&config, &task_dir, command)?;
            let record = lifecycle
                .start_terminal_session(TerminalStart {
                    task_name,
                    task_dir,
                    agent,
                    max_iterations,
                    command,
                    env: BTreeMap::new(),
                })
                .await?;
            println!(
                "Started {} in {}",
                record.task_name,
                multiplexer.session_name(&record.task_name)
            );
        }
        Command::Status { json, remote } => {
            if remote {
                for entry in lifecycle.refresh_remote().await? {
                    if entry.status.is_none() {
                        eprintln!("{}: remote daemon unreachable, status unknown", entry.task_name);
                    }
                }
            }
            let records = lifecycle.status().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                print_table(&records);
            }
        }
        Command::Stop { task } => {
            let record = lifecycle.stop(&task).await?;
            println!("Stop requested for {} (status: {})", task, record.status.as_str());
        }
        Command::Checkpoint { task } => {
            lifecycle.checkpoint(&task).await?;
            println!("Checkpoint requested for {task}");
        }
        Command::Attach { task } => {
            let target = lifecycle.attach(&task).await?;
            return attach(&config, multiplexer.as_ref(), network, target).await;
        }
        Command::Clean { all } => {
            let removed = lifecycle.clean(all).await?;
            if removed.is_empty() {
                println!("Nothing to clean");
            }
            for task in removed {
                println!("Removed {task}");
            }
        }
        Command::Remote { command } => match command {
            RemoteCommand::Status => {
                for entry in lifecycle.refresh_remote().await? {
                    let status = entry.status.map_or("unknown", |s| s.as_str());
                    println!("{:<24} {status}", entry.task_name);
                }
            }
            RemoteCommand::Start {
                host,
                task_dir,
                task,
                agent,
                max_iterations,
                model,
            } => {
                require_identity(config.overlay.identity_path.as_ref())?;
                let task_name = task.unwrap_or_else(|| default_task_name(Path::new(&task_dir)));
                let record = lifecycle
                    .start_remote_session(
                        &host,
                        &StartSessionParams {
                            task_name,
                            task_dir,
                            agent,
                            max_iterations,
                            model,
                        },
                    )
                    .await?;
                println!(
                    "Started {} on {host} (service: {})",
                    record.task_name,
                    record.overlay.service_name.as_deref().unwrap_or("-")
                );
            }
            RemoteCommand::Stop { task } => {
                lifecycle.stop(&task).await?;
                println!("Stopped {task}");
            }
        },
        Command::Rpc { task, command } => return rpc(&config, &task, command).await,
    }
    Ok(ExitCode::SUCCESS)
}

async fn attach(
    config: &GlobalConfig,
    multiplexer: &dyn Multiplexer,
    network: Arc<dyn OverlayNetwork>,
    target: AttachTarget,
) -> Result<ExitCode> {
    let code = match target {
        AttachTarget::Terminal { session_name } => multiplexer.attach(&session_name).await?,
        AttachTarget::AgentServer {
            url,
            agent_session_id,
        } => run_agent_attach(config, &url, agent_session_id.as_deref()).await?,
        AttachTarget::Remote {
            service_name,
            identity_path,
            agent_session_id,
        } => {
            let context = network.load_identity(&identity_path).await?;
            let mut forwarder = LocalForwarder::start(context, &service_name).await?;
            let code = run_agent_attach(config, &forwarder.url(), agent_session_id.as_deref()).await;
            forwarder.shutdown().await;
            code?
        }
        AttachTarget::RemoteTerminal { host, session_name } => {
            let remote = format!(
                "{} attach-session -t {}",
                shell_quote(&config.multiplexer.binary),
                shell_quote(&session_name)
            );
            let status = tokio::process::Command::new("ssh")
                .args(["-t", &host, &remote])
                .status()
                .await?;
            status.code().unwrap_or(1)
        }
    };
    Ok(exit_code(code))
}

async fn run_agent_attach(
    config: &GlobalConfig,
    url: &str,
    agent_session_id: Option<&str>,
) -> Result<i32> {
    let mut cmd = tokio::process::Command::new(&config.agent_server.binary);
    cmd.args(&config.agent_server.attach_args).arg(url);
    if let Some(id) = agent_session_id {
        cmd.args(["--session", id]);
    }
    let status = cmd.status().await.map_err(|err| {
        AppError::Config(format!(
            "failed to run {}: {err}",
            config.agent_server.binary
        ))
    })?;
    Ok(status.code().unwrap_or(1))
}

async fn rpc(config: &GlobalConfig, task: &str, command: RpcCommand) -> Result<ExitCode> {
    let socket = config.socket_path(task);
    let client = RpcClient::connect(&socket).await.map_err(|err| {
        AppError::Ipc(format!(
            "cannot reach control socket {}: {err}",
            socket.display()
        ))
    })?;

    let result = match command {
        RpcCommand::Status => client.request("get_status", json!({})).await?,
        RpcCommand::Interactive { state } => {
            let enabled = match state.as_str() {
                "on" | "true" => true,
                "off" | "false" => false,
                other => {
                    return Err(AppError::Config(format!(
                        "expected on or off, got '{other}'"
                    )))
                }
            };
            client
                .request("set_interactive_mode", json!({ "enabled": enabled }))
                .await?
        }
        RpcCommand::Write { data } => client.request("write_pty", json!({ "data": data })).await?,
        RpcCommand::Inject { prompt } => {
            client
                .request("inject_prompt", json!({ "prompt": prompt }))
                .await?
        }
        RpcCommand::Watch { events } => {
            let Some(mut rx) = client.take_events() else {
                return Err(AppError::Ipc("event stream unavailable".into()));
            };
            client
                .request("subscribe", json!({ "events": events }))
                .await?;
            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Some(event) => println!("{}", event.params),
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
            return Ok(ExitCode::SUCCESS);
        }
    };
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(ExitCode::SUCCESS)
}

fn driver_command(config: &GlobalConfig, task_dir: &Path, explicit: Vec<String>) -> Result<String> {
    let parts = if explicit.is_empty() {
        let Some(binary) = config.driver.binary.clone() else {
            return Err(AppError::Config(
                "no driver command given and driver.binary is not configured".into(),
            ));
        };
        let mut parts = vec![binary];
        parts.extend(config.driver.args.iter().cloned());
        parts.push(task_dir.to_string_lossy().into_owned());
        parts
    } else {
        explicit
    };
    Ok(parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" "))
}

fn default_task_name(task_dir: &Path) -> String {
    task_dir
        .file_name()
        .map_or_else(|| "task".to_owned(), |n| n.to_string_lossy().into_owned())
}

fn print_table(records: &[SessionRecord]) {
    if records.is_empty() {
        println!("No sessions");
        return;
    }
    println!(
        "{:<24} {:<12} {:<12} {:<8} {:<9} STORY",
        "TASK", "STATUS", "MODE", "VIA", "ITER"
    );
    for r in records {
        let iterations = format!("{}/{}", r.iteration, r.max_iterations);
        println!(
            "{:<24} {:<12} {:<12} {:<8} {:<9} {}",
            r.task_name,
            r.status.as_str(),
            r.execution_mode.as_str(),
            r.transport.as_str(),
            iterations,
            r.current_story.as_deref().unwrap_or("-")
        );
    }
}

fn exit_code(code: i32) -> ExitCode {
    u8::try_from(code).map_or(ExitCode::FAILURE, ExitCode::from)
}
