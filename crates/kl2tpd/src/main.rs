//! kl2tpd: a minimal L2TP daemon.
//!
//! Loads a TOML configuration describing tunnels and sessions, brings
//! them up as an L2TP Access Concentrator, and runs until SIGINT or
//! SIGTERM triggers a graceful teardown.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{error, info};

use l2tp::{Config, Context, DataPlaneKind, Event, EventHandler};

#[derive(Parser, Debug)]
#[command(name = "kl2tpd")]
#[command(about = "L2TP daemon for the Linux kernel L2TP subsystem", long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(long, value_name = "FILE", default_value = "/etc/kl2tpd/kl2tpd.toml")]
    config: PathBuf,

    /// Verbose log output
    #[arg(long)]
    verbose: bool,

    /// Use the null data plane (no kernel interaction; for protocol
    /// testing without root)
    #[arg(long)]
    null: bool,
}

/// Logs tunnel and session state changes.
struct EventLogger;

impl EventHandler for EventLogger {
    fn handle_event(&self, event: &Event) {
        match event {
            Event::TunnelUp { name, .. } => info!(tunnel = %name, "tunnel up"),
            Event::TunnelDown { name, cause, .. } => match cause {
                Some(cause) => info!(tunnel = %name, %cause, "tunnel down"),
                None => info!(tunnel = %name, "tunnel down"),
            },
            Event::SessionUp {
                tunnel_name, name, ..
            } => info!(tunnel = %tunnel_name, session = %name, "session up"),
            Event::SessionDown {
                tunnel_name, name, ..
            } => info!(tunnel = %tunnel_name, session = %name, "session down"),
        }
    }
}

fn run(args: &Args) -> Result<(), String> {
    let config = Config::from_file(&args.config)
        .map_err(|err| format!("failed to load configuration: {err}"))?;

    let dataplane = if args.null {
        DataPlaneKind::Null
    } else {
        DataPlaneKind::LinuxKernel
    };
    let ctx =
        Context::new(dataplane).map_err(|err| format!("failed to create L2TP context: {err}"))?;
    ctx.register_event_handler(Arc::new(EventLogger));

    let mut signals =
        Signals::new([SIGINT, SIGTERM]).map_err(|err| format!("failed to install signal handler: {err}"))?;

    for tunnel_config in &config.tunnels {
        let tunnel = ctx
            .new_dynamic_tunnel(&tunnel_config.name, &tunnel_config.config)
            .map_err(|err| {
                ctx.close();
                format!("failed to create tunnel {:?}: {err}", tunnel_config.name)
            })?;

        for session_config in &tunnel_config.sessions {
            tunnel
                .new_session(&session_config.name, &session_config.config)
                .map_err(|err| {
                    ctx.close();
                    format!(
                        "failed to create session {:?}: {err}",
                        session_config.name
                    )
                })?;
        }
    }

    if let Some(signal) = signals.forever().next() {
        info!(signal, "received signal, shutting down");
    }
    ctx.close();
    Ok(())
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(if args.verbose { "debug" } else { "info" })
            }),
        )
        .init();

    if let Err(err) = run(&args) {
        error!("{err}");
        std::process::exit(1);
    }
}
