// Copyright 2024 encode-offload Authors
// SPDX-License-Identifier: Apache-2.0

//! Host Service CLI entry point

use std::sync::Arc;

use anyhow::Context;
use clap::{Arg, ArgAction, Command};
use log::{info, warn, LevelFilter};
use simple_logger::SimpleLogger;

use encode_host_service::{HostConfig, HostTaskRegistry, RpcServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let matches = Command::new("encode-host-service")
        .version("0.1.0")
        .author("encode-offload Authors")
        .about("Host encode service for shared-memory encode offload")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file"),
        )
        .arg(
            Arg::new("listen")
                .short('l')
                .long("listen")
                .value_name("ADDR")
                .help("Address to listen on, host:port"),
        )
        .arg(
            Arg::new("device-id")
                .short('d')
                .long("device-id")
                .value_name("ID")
                .value_parser(clap::value_parser!(u32))
                .help("Device id reported to guests"),
        )
        .arg(
            Arg::new("no-loopback")
                .long("no-loopback")
                .action(ArgAction::SetTrue)
                .help("Do not start the loopback encoder"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Enable verbose logging"),
        )
        .get_matches();

    // Initialize logging
    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    SimpleLogger::new()
        .with_level(log_level)
        .init()
        .context("failed to initialise logging")?;

    // Build configuration
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => HostConfig::from_file(path).with_context(|| format!("loading {path}"))?,
        None => HostConfig::default(),
    };
    if let Some(addr) = matches.get_one::<String>("listen") {
        config.listen_addr = addr.clone();
    }
    if let Some(&device_id) = matches.get_one::<u32>("device-id") {
        config.device_id = device_id;
    }
    if matches.get_flag("no-loopback") {
        config.loopback = false;
    }

    info!("Starting encode-host-service with config: {:?}", config);

    let listen_addr = config.listen_addr.clone();
    let registry = Arc::new(HostTaskRegistry::new(config));
    let server = RpcServer::bind(&listen_addr, registry.clone())
        .await
        .with_context(|| format!("binding {listen_addr}"))?;

    server
        .serve(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Cannot wait for Ctrl+C: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await
        .context("RPC server failed")?;

    info!("Stopping tasks...");
    tokio::task::spawn_blocking(move || registry.shutdown())
        .await
        .context("task shutdown failed")?;

    info!("Host service stopped");
    Ok(())
}
