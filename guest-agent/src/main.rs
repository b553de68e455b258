// Copyright 2024 encode-offload Authors
// SPDX-License-Identifier: Apache-2.0

//! Guest Agent CLI entry point
//!
//! Runs inside the VM and pushes frames through the host encoder.

use std::sync::atomic::Ordering;

use anyhow::{bail, Context};
use clap::{Arg, ArgAction, Command};
use log::{info, LevelFilter};
use simple_logger::SimpleLogger;

use encode_guest_agent::{AgentConfig, GuestAgent};

fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let matches = Command::new("encode-guest-agent")
        .version("0.1.0")
        .author("encode-offload Authors")
        .about("Guest Agent for shared-memory encode offload")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file"),
        )
        .arg(
            Arg::new("host")
                .short('H')
                .long("host")
                .value_name("ADDR")
                .help("Host encode service address, host:port"),
        )
        .arg(
            Arg::new("frames")
                .short('n')
                .long("frames")
                .value_name("N")
                .value_parser(clap::value_parser!(u32))
                .help("Frames to push per task"),
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
        Some(path) => AgentConfig::from_file(path).with_context(|| format!("loading {path}"))?,
        None => AgentConfig::default(),
    };
    if let Some(host) = matches.get_one::<String>("host") {
        config.host_addr = host.clone();
    }
    if let Some(&frames) = matches.get_one::<u32>("frames") {
        for task in &mut config.tasks {
            task.frames = frames;
        }
    }

    info!(
        "Starting encode-guest-agent against {} with {} task(s)",
        config.host_addr,
        config.tasks.len()
    );

    let agent = GuestAgent::new(config);

    // Set up Ctrl+C handler
    let terminate = agent.terminate_flag();
    ctrlc::set_handler(move || {
        terminate.store(true, Ordering::Release);
    })
    .context("failed to install Ctrl+C handler")?;

    let reports = agent.run();
    let failed = reports.iter().filter(|r| r.is_err()).count();

    info!("Guest agent finished");
    if failed > 0 {
        bail!("{failed} of {} task(s) failed", reports.len());
    }
    Ok(())
}
