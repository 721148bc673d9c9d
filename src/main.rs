mod config;
mod console;
mod controller;
mod elevation;
mod embedded;
mod error;
mod executor;
mod shell;
mod strategy;
mod worker;

use crate::config::{
    default_config_yaml, ensure_parent, read_config, resolve_config_path, Config,
};
use crate::console::{spawn_event_printer, Console};
use crate::controller::{strategy_label, ServiceController};
use crate::error::TetherError;
use crate::worker::ControllerHandle;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use std::fs;
use std::io;
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "TETHER_LOG";

#[derive(Parser, Debug)]
#[command(name = "tether", version, about = "Tether agent lifecycle CLI")]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Probe for a usable elevation mechanism.
    Detect,
    /// Launch the agent against a remote server.
    Start {
        #[arg(long)]
        remote: Option<String>,
    },
    Stop,
    Debug {
        #[command(subcommand)]
        command: DebugCommand,
    },
    Status,
    /// Interactive session reading commands from stdin.
    Console,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Init,
    Show,
    Validate,
}

#[derive(Subcommand, Debug)]
enum DebugCommand {
    Enable,
    Disable,
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_kind: Option<String>,
}

#[derive(Debug, Clone)]
struct Context {
    config_path: PathBuf,
    json: bool,
}

fn main() -> Result<(), TetherError> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let ctx = build_context(&cli);

    let result = match cli.command {
        Commands::Config { command } => handle_config(&ctx, command),
        Commands::Detect => handle_detect(&ctx),
        Commands::Start { remote } => handle_start(&ctx, remote),
        Commands::Stop => handle_stop(&ctx),
        Commands::Debug { command } => handle_debug(&ctx, command),
        Commands::Status => handle_status(&ctx),
        Commands::Console => handle_console(&ctx),
    };

    if let Err(err) = result {
        if ctx.json {
            let payload = JsonResult::<serde_json::Value> {
                ok: false,
                result: None,
                error: Some(err.to_string()),
                error_kind: Some(err.kind().to_string()),
            };
            print_json(&payload)?;
        } else {
            eprintln!("{err}");
        }
        std::process::exit(1);
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn build_context(cli: &Cli) -> Context {
    Context {
        config_path: resolve_config_path(cli.config.as_ref()),
        json: cli.json,
    }
}

fn load_config(ctx: &Context) -> Result<Config, TetherError> {
    debug!(path = %ctx.config_path.display(), "loading config");
    read_config(&ctx.config_path)
}

/// Spawns the controller worker and runs detection so the active strategy is known.
fn open_controller(cfg: &Config) -> Result<ControllerHandle, TetherError> {
    let (handle, _join) = worker::spawn(ServiceController::from_config(cfg))?;
    handle.detect()?;
    Ok(handle)
}

fn handle_config(ctx: &Context, command: ConfigCommand) -> Result<(), TetherError> {
    match command {
        ConfigCommand::Init => {
            if ctx.config_path.exists() {
                return output(
                    ctx,
                    json!({"path": ctx.config_path, "created": false}),
                    format!("config already exists at {}", ctx.config_path.display()),
                );
            }
            ensure_parent(&ctx.config_path)?;
            fs::write(&ctx.config_path, default_config_yaml())?;
            output(
                ctx,
                json!({"path": ctx.config_path, "created": true}),
                format!("wrote {}", ctx.config_path.display()),
            )
        }
        ConfigCommand::Show => {
            let cfg = load_config(ctx)?;
            let text = serde_yaml::to_string(&cfg)?;
            output(ctx, serde_json::to_value(&cfg)?, text.trim_end().to_string())
        }
        ConfigCommand::Validate => {
            load_config(ctx)?;
            output(
                ctx,
                json!({"path": ctx.config_path, "valid": true}),
                "config ok".to_string(),
            )
        }
    }
}

fn handle_detect(ctx: &Context) -> Result<(), TetherError> {
    let cfg = load_config(ctx)?;
    let (handle, _join) = worker::spawn(ServiceController::from_config(&cfg))?;
    let elevation = handle.detect()?;
    let strategy = handle.status()?.strategy;
    output(
        ctx,
        json!({
            "elevation": elevation,
            "label": elevation.label(),
            "strategy": strategy,
        }),
        format!(
            "elevation: {}\nstrategy: {}",
            elevation.label(),
            strategy_label(strategy)
        ),
    )
}

fn handle_start(ctx: &Context, remote: Option<String>) -> Result<(), TetherError> {
    let cfg = load_config(ctx)?;
    let remote = cfg.effective_remote(remote.as_deref());
    let handle = open_controller(&cfg)?;
    let state = handle.start(&remote)?;
    let text = match state.listen_port {
        Some(port) => format!("agent running ({remote}, local port {port})"),
        None => format!("agent running ({remote})"),
    };
    output(ctx, serde_json::to_value(&state)?, text)
}

fn handle_stop(ctx: &Context) -> Result<(), TetherError> {
    let cfg = load_config(ctx)?;
    let handle = open_controller(&cfg)?;
    let state = handle.stop()?;
    output(ctx, serde_json::to_value(&state)?, "agent stopped".to_string())
}

fn handle_debug(ctx: &Context, command: DebugCommand) -> Result<(), TetherError> {
    let cfg = load_config(ctx)?;
    let handle = open_controller(&cfg)?;
    let enabled = matches!(command, DebugCommand::Enable);
    let state = handle.set_debug(enabled)?;
    output(
        ctx,
        serde_json::to_value(&state)?,
        format!("debug {}", if enabled { "enabled" } else { "disabled" }),
    )
}

fn handle_status(ctx: &Context) -> Result<(), TetherError> {
    let cfg = load_config(ctx)?;
    let handle = open_controller(&cfg)?;
    let report = handle.status()?;
    output(ctx, serde_json::to_value(&report)?, report.render())
}

fn handle_console(ctx: &Context) -> Result<(), TetherError> {
    let cfg = load_config(ctx)?;
    let (handle, _join) = worker::spawn(ServiceController::from_config(&cfg))?;
    let printer = spawn_event_printer(handle.subscribe()?)?;
    let elevation = handle.detect()?;
    println!("elevation: {}", elevation.label());

    let console = Console::new(&handle, cfg.effective_remote(None));
    let stdin = io::stdin();
    let result = console.run(stdin.lock(), io::stdout());
    drop(handle);
    // The printer ends once the worker drops its subscriber list.
    let _ = printer.join();
    result
}

fn output(ctx: &Context, payload: serde_json::Value, text: String) -> Result<(), TetherError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
            error_kind: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{text}");
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), TetherError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
