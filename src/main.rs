// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Command line front end of the Modbus TCP gateway.

use std::{net::SocketAddr, path::PathBuf, process::ExitCode, sync::Arc};

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};

use tokio_modbus_gateway::{config::Config, router::Router, server::TcpServer};

/// Modbus TCP gateway with TCP, TLS and RTU backends.
#[derive(Parser, Debug)]
#[command(name = "modbus-gateway", disable_version_flag = true)]
struct Args {
    /// Modbus TCP server listen address
    #[arg(short = 'l', value_name = "ADDR", default_value = ":502")]
    listen: String,

    /// Config file name
    #[arg(short = 'c', value_name = "FILE", default_value = "config.yaml")]
    config: PathBuf,

    /// Client read timeout in milliseconds (0 = none)
    #[arg(short = 't', value_name = "MS", default_value_t = 0)]
    timeout: u64,

    /// Show version
    #[arg(short = 'v')]
    version: bool,
}

/// Listen addresses may omit the host (`:502`), meaning all interfaces.
fn parse_listen_addr(addr: &str) -> Option<SocketAddr> {
    if let Some(port_only) = addr.strip_prefix(':') {
        return format!("0.0.0.0:{port_only}").parse().ok();
    }
    addr.parse().ok()
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let args = Args::parse();

    if args.version {
        println!("Version: {}", env!("CARGO_PKG_VERSION"));
        return ExitCode::SUCCESS;
    }

    let Some(listen_addr) = parse_listen_addr(&args.listen) else {
        log::error!("Invalid listen address {}", args.listen);
        return ExitCode::FAILURE;
    };

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            log::error!("Load config file {} got error: {err}", args.config.display());
            return ExitCode::FAILURE;
        }
    };

    let router = Arc::new(Router::new(Arc::clone(&config)));
    let server = match TcpServer::bind(listen_addr, args.timeout, Arc::clone(&router)).await {
        Ok(server) => server,
        Err(err) => {
            log::error!("Cannot start Modbus TCP server: {err}");
            return ExitCode::FAILURE;
        }
    };
    log::info!("Start Modbus TCP server at {listen_addr}");

    tokio::spawn(async move { server.serve().await });

    match wait_signals(&config, &router).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("Signal handling failed: {err}");
            ExitCode::FAILURE
        }
    }
}

/// Block on process signals: SIGHUP reloads the configuration and recycles
/// the live backends, SIGINT and SIGTERM terminate the gateway.
async fn wait_signals(config: &Config, router: &Router) -> std::io::Result<()> {
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    loop {
        tokio::select! {
            _ = sighup.recv() => match config.reload() {
                Ok(()) => {
                    router.reload().await;
                    log::info!("Configuration reloaded");
                }
                // Keep serving with the previous configuration.
                Err(err) => log::error!("Reload config file got error: {err}"),
            },
            _ = sigint.recv() => break,
            _ = sigterm.recv() => break,
        }
    }
    log::info!("Server exit");
    Ok(())
}
