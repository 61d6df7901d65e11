//! torctl-rs CLI application entry point.
//!
//! Launches or attaches to Tor, keeps the status registry and web proxy
//! running, and logs what Tor reports until CTRL+C or until Tor goes away.
//!
//! # Startup Flow
//!
//! ```text
//!   ┌─────────────────┐
//!   │  Parse CLI Args │
//!   └────────┬────────┘
//!            ▼
//!   ┌──────────────────┐      ┌─────────────────┐
//!   │ --generate_config│────▶ │ Write defaults  │────▶ Exit
//!   └────────┬─────────┘      └─────────────────┘
//!            ▼
//!   ┌─────────────────┐
//!   │  Load Config    │ ◄── Defaults → File → Env/CLI
//!   └────────┬────────┘
//!            ▼
//!   ┌─────────────────┐
//!   │ Init Logging    │
//!   └────────┬────────┘
//!            ▼
//!   ┌─────────────────┐
//!   │ Create/Attach   │ ◄── tor_path set: launch tor
//!   └────────┬────────┘
//!            ▼
//!   ┌─────────────────┐
//!   │ Run until       │ ◄── CTRL+C or shutdown notification
//!   │ stopped         │
//!   └─────────────────┘
//! ```
//!
//! # Exit Codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | Success |
//! | 1 | Error (see stderr for details) |

use clap::Parser;
use std::process::ExitCode;
use tokio::sync::broadcast::error::RecvError;

use torctl_rs::client::{Client, ClientCreateParams, ClientOptions, ClientRemoteParams};
use torctl_rs::status::RegistryChange;
use torctl_rs::{config, logger, CliArgs, Config, EventKind, LogLevel, SecurePassword, TorEvent};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> torctl_rs::Result<()> {
    let args = CliArgs::parse();

    if let Some(ref output_path) = args.generate_config {
        config::generate_config(output_path)?;
        println!("Wrote default config to {}", output_path.display());
        return Ok(());
    }

    let config = config::load_config(&args)?;
    logger::init(config.loglevel, config.logfile.as_deref())?;

    logger::plog(
        LogLevel::Notice,
        &format!("torctl-rs {} starting", torctl_rs::VERSION),
    );
    logger::plog(
        LogLevel::Debug,
        &format!("Control port: {}:{}", config.control_ip, config.control_port),
    );

    let mut client = start_client(&config).await?;

    let registry = client.status();
    let mut changes = registry.changes();
    let _bandwidth = client.events().subscribe(EventKind::Bandwidth, |event| {
        if let TorEvent::Bandwidth {
            downloaded,
            uploaded,
        } = event
        {
            logger::plog(
                LogLevel::Debug,
                &format!("Bandwidth: {} down, {} up", downloaded, uploaded),
            );
        }
    });
    let mut shutdown = client.shutdown_notifications();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                logger::plog(LogLevel::Notice, "Interrupted, shutting down");
                break;
            }
            reason = shutdown.wait_for(|reason| reason.is_some()) => {
                if let Ok(reason) = reason {
                    if let Some(reason) = *reason {
                        logger::plog(LogLevel::Warn, &format!("Stopping: {}", reason));
                    }
                }
                break;
            }
            change = changes.recv() => match change {
                Ok(RegistryChange::Circuits) => logger::plog(
                    LogLevel::Debug,
                    &format!("{} circuits tracked", registry.circuits().len()),
                ),
                Ok(RegistryChange::Streams) => logger::plog(
                    LogLevel::Debug,
                    &format!("{} streams tracked", registry.streams().len()),
                ),
                Ok(RegistryChange::OrConnections) => logger::plog(
                    LogLevel::Debug,
                    &format!("{} OR connections tracked", registry.or_connections().len()),
                ),
                Err(RecvError::Lagged(skipped)) => logger::plog(
                    LogLevel::Debug,
                    &format!("skipped {} registry changes", skipped),
                ),
                Err(RecvError::Closed) => break,
            },
        }
    }

    client.shutdown().await;
    Ok(())
}

async fn start_client(config: &Config) -> torctl_rs::Result<Client> {
    let options = ClientOptions::from_config(config);
    let password = config.control_pass.clone().unwrap_or_default();

    match config.tor_path {
        Some(ref tor_path) => {
            let mut params = ClientCreateParams::new(tor_path.clone());
            params.control_port = config.control_port;
            params.control_password = SecurePassword::new(password);
            params.socks_port = config.socks_port;
            params.torrc = config.torrc.clone();
            params.defaults_torrc = config.defaults_torrc.clone();
            Client::create(params, options).await
        }
        None => {
            let mut params =
                ClientRemoteParams::new(config.control_ip.clone(), config.control_port, password);
            params.socks_port = config.socks_port;
            Client::connect(params, options).await
        }
    }
}
