//! ---
//! canopy_section: "04-operator-console"
//! canopy_subsection: "binary"
//! canopy_type: "source"
//! canopy_scope: "code"
//! canopy_description: "Binary entrypoint for the Canopy operator console."
//! canopy_version: "v0.0.0-prealpha"
//! canopy_owner: "tbd"
//! ---
mod commands;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use canopy_bridge::{BridgeEvent, BridgeMetrics, TelemetryBridge};
use canopy_common::{init_tracing, ConsoleConfig};
use canopy_msg::{EventClass, StatusResponse};
use clap::{Parser, Subcommand};
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{info, warn};

use crate::commands::{OperatorCommand, HELP};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Canopy greenhouse operator console",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(
        long,
        value_name = "URL",
        env = "CANOPY_BACKEND_URL",
        help = "Override the backend base URL"
    )]
    backend_url: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Connect to the backend and accept operator commands")]
    Run,
    #[command(about = "Print backend health and exit")]
    Status,
    #[command(about = "Hand a goal to the backend planner and exit")]
    Goal {
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/console.toml"));
    candidates.push(PathBuf::from("configs/console.example.toml"));

    let (mut config, config_path) = match ConsoleConfig::load_with_source(&candidates) {
        Ok(loaded) => (loaded.config, Some(loaded.source)),
        Err(err) if cli.config.is_none() => {
            eprintln!("{err:#}; using built-in defaults");
            (ConsoleConfig::default(), None)
        }
        Err(err) => return Err(err),
    };
    if let Some(url) = cli.backend_url {
        config.backend.base_url = url;
    }
    config.validate()?;
    init_tracing("canopy-console", &config.logging)?;
    info!(
        config_path = ?config_path,
        backend = %config.backend.base_url,
        "configuration loaded"
    );

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_console(config).await?,
        Commands::Status => {
            let bridge = TelemetryBridge::with_http_backend(&config, None)?;
            let status = bridge.backend_status().await?;
            println!("{}", render_status(&status));
        }
        Commands::Goal { text } => {
            let bridge = TelemetryBridge::with_http_backend(&config, None)?;
            let result = bridge.submit_goal(&text.join(" ")).await?;
            println!("goal accepted");
            if let Some(result) = result {
                println!("{}", serde_json::to_string_pretty(&result)?);
            }
        }
    }

    Ok(())
}

async fn run_console(config: ConsoleConfig) -> Result<()> {
    let registry = Registry::new();
    let metrics = Arc::new(
        BridgeMetrics::register(&registry).context("failed to register bridge metrics")?,
    );
    let bridge = TelemetryBridge::with_http_backend(&config, Some(metrics))?;

    let mut events = bridge.subscribe();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let Some(line) = render_event(&event) {
                println!("{line}");
            }
        }
    });

    bridge.start();
    println!("canopy console ready; type `help` for commands");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("ctrl-c received; shutting down");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    info!("stdin closed; shutting down");
                    break;
                };
                match OperatorCommand::parse(&line) {
                    Ok(Some(OperatorCommand::Quit)) => break,
                    Ok(Some(command)) => execute(&bridge, &registry, command).await,
                    Ok(None) => {}
                    Err(err) => println!("{err}"),
                }
            }
        }
    }

    bridge.stop().await;
    printer.abort();
    Ok(())
}

async fn execute(bridge: &TelemetryBridge, registry: &Registry, command: OperatorCommand) {
    let outcome: Result<String> = match command {
        OperatorCommand::Set { name, value } => bridge
            .set_actuator(&name, value)
            .await
            .map(|ack| format!("{} forced to {}", ack.name, ack.value))
            .map_err(Into::into),
        OperatorCommand::Toggle { name } => bridge
            .toggle_actuator(&name)
            .await
            .map(|ack| format!("{} forced to {}", ack.name, ack.value))
            .map_err(Into::into),
        OperatorCommand::Clear { name } => bridge
            .clear_override(&name)
            .await
            .map(|released| {
                if released {
                    format!("{name} back under automatic control")
                } else {
                    format!("{name} was not overridden")
                }
            })
            .map_err(Into::into),
        OperatorCommand::ClearAll => bridge
            .clear_all_overrides()
            .await
            .map(|released| format!("released {} override(s)", released.len()))
            .map_err(Into::into),
        OperatorCommand::Goal(goal) => bridge
            .submit_goal(&goal)
            .await
            .map(|result| match result {
                Some(result) => format!("goal accepted: {result}"),
                None => "goal accepted".to_owned(),
            })
            .map_err(Into::into),
        OperatorCommand::Edit {
            section,
            field,
            value,
        } => {
            bridge.edit_setting(&section, &field, value);
            Ok(format!("{section}.{field} edited; saving shortly"))
        }
        OperatorCommand::Close { section } => bridge
            .close_settings(&section)
            .await
            .map(|bcc| match bcc {
                Some(bcc) => format!("{section} saved (bcc {bcc})"),
                None => format!("{section} has no unsaved edits"),
            })
            .map_err(Into::into),
        OperatorCommand::Send { command, payload } => bridge
            .submit_command(&command, payload)
            .await
            .map(|sequence| format!("{command} sent (#{sequence})"))
            .map_err(Into::into),
        OperatorCommand::Ping => bridge
            .ping()
            .await
            .map(|sequence| format!("PING sent (#{sequence})"))
            .map_err(Into::into),
        OperatorCommand::Status => bridge
            .backend_status()
            .await
            .map(|status| render_status(&status))
            .map_err(Into::into),
        OperatorCommand::Show => Ok(render_overview(bridge)),
        OperatorCommand::Settings => bridge
            .load_settings()
            .await
            .map_err(anyhow::Error::from)
            .and_then(|settings| Ok(serde_json::to_string_pretty(&settings)?)),
        OperatorCommand::Metrics => render_metrics(registry),
        OperatorCommand::Help => Ok(HELP.to_owned()),
        OperatorCommand::Quit => Ok(String::new()),
    };

    match outcome {
        Ok(text) => println!("{text}"),
        Err(err) => {
            warn!(error = %err, "operator command failed");
            println!("error: {err}");
        }
    }
}

fn render_event(event: &BridgeEvent) -> Option<String> {
    let line = match event {
        BridgeEvent::Connection(state) => format!("[link] {state:?}"),
        BridgeEvent::Liveness(record) => match record.uptime {
            Some(uptime) => format!("[backend] {:?} (uptime {uptime:.0}s)", record.state),
            None => format!("[backend] {:?}", record.state),
        },
        BridgeEvent::Telemetry(telemetry)
            if matches!(telemetry.classify(), EventClass::Heartbeat(_)) =>
        {
            return None
        }
        BridgeEvent::Telemetry(telemetry) => format!("[event] {}", telemetry.name()),
        BridgeEvent::OverrideEngaged { name, value } => {
            format!("[override] {name} held at {value}")
        }
        BridgeEvent::OverrideReleased { name } => format!("[override] {name} released"),
        BridgeEvent::SettingsSaved { section, bcc } => {
            format!("[settings] {section} saved (bcc {bcc})")
        }
        BridgeEvent::SettingsFailed { section, reason } => {
            format!("[settings] {section} NOT saved: {reason}")
        }
        BridgeEvent::CommandRejected(rejection) => format!("[rejected] {rejection}"),
    };
    Some(line)
}

fn render_overview(bridge: &TelemetryBridge) -> String {
    let liveness = bridge.liveness();
    let mut out = format!(
        "link: {:?}  backend: {:?}",
        bridge.connection_state(),
        liveness.state
    );
    if let Some(seen) = liveness.last_seen {
        out.push_str(&format!("  last heartbeat: {}", seen.format("%H:%M:%S")));
    }
    for actuator in bridge.registry().snapshot() {
        let mode = if actuator.is_overridden() { "MANUAL" } else { "auto" };
        out.push_str(&format!("\n  {:<20} {:>8}  {mode}", actuator.name, actuator.value.to_string()));
    }
    let pending = bridge.pending_sections();
    if !pending.is_empty() {
        out.push_str(&format!("\n  unsaved settings: {}", pending.join(", ")));
    }
    out
}

fn render_status(status: &StatusResponse) -> String {
    match &status.uptime {
        Some(uptime) => format!("backend {:?}, uptime {uptime}", status.status),
        None => format!("backend {:?}", status.status),
    }
}

fn render_metrics(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
