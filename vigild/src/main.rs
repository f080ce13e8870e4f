// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use vigild::config::{Config, DEFAULT_CONFIG_PATH};
use vigild::{daemon, logging, signals};

/// Supervisor daemon for a network intrusion-detection engine.
#[derive(Parser)]
#[command(name = "vigild", version, about)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Run in the foreground (do not daemonize)
    #[arg(short, long)]
    foreground: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    logging::init(if cli.debug { "debug" } else { "info" })?;
    info!(version = vigil_common::VERSION, "starting vigild");

    let mut config = Config::default();
    config.load(&cli.config)?;
    config.apply_env();

    // Command line beats file and environment.
    if cli.foreground {
        config.general.daemonize = false;
    }
    if cli.debug {
        config.general.log_level = "debug".to_owned();
    }
    logging::set_level(&config.general.log_level)?;

    config.validate()?;

    if config.general.daemonize {
        daemon::daemonize()?;
    }

    signals::install()?;

    let mut daemon = daemon::Daemon::new(config, &cli.config)?;
    daemon.run()
}
