// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod client;
mod output;

use clap::{Parser, Subcommand};
use client::ControlClient;
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;
use vigil_ipc::{Command, Request};

const DEFAULT_SOCKET: &str = "/var/run/vigil/api.sock";

/// Control client for the vigil daemon.
#[derive(Parser)]
#[command(name = "vigilctl", version, about)]
struct Cli {
    /// Daemon control socket path
    #[arg(long, default_value = DEFAULT_SOCKET)]
    socket: PathBuf,

    /// Print the raw JSON response
    #[arg(long)]
    json: bool,

    /// Suppress confirmation output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Show daemon and detector status
    Status,
    /// Show combined daemon and detector statistics
    Stats,
    /// List recent security events
    Events {
        /// Maximum number of events
        #[arg(short = 'n', long, default_value_t = 10)]
        limit: usize,
        /// Only events at least this severe (critical, high, medium, low)
        #[arg(short, long)]
        severity: Option<String>,
        /// Only events at or after this epoch timestamp
        #[arg(short = 't', long)]
        since: Option<i64>,
    },
    /// List or validate detection rules
    Rules {
        /// Validate the rule set instead of listing it
        #[arg(short, long)]
        validate: bool,
    },
    /// Ask the detector to reload its rules
    Reload,
    /// Change a daemon configuration key
    Config {
        /// Configuration key
        key: String,
        /// New value
        value: String,
    },
    /// Shut the daemon down
    Shutdown,
}

fn build_request(command: &CliCommand) -> Request {
    match command {
        CliCommand::Status => Request::new(Command::Status),
        CliCommand::Stats => Request::new(Command::GetStats),
        CliCommand::Events {
            limit,
            severity,
            since,
        } => {
            let mut params = json!({"limit": limit});
            if let Some(severity) = severity {
                params["severity"] = json!(severity);
            }
            if let Some(since) = since {
                params["since"] = json!(since);
            }
            Request::with_params(Command::ListEvents, params)
        }
        CliCommand::Rules { validate: false } => Request::new(Command::ListRules),
        CliCommand::Rules { validate: true } => Request::new(Command::ValidateRules),
        CliCommand::Reload => Request::new(Command::ReloadRules),
        CliCommand::Config { key, value } => {
            Request::with_params(Command::SetConfig, json!({"key": key, "value": value}))
        }
        CliCommand::Shutdown => Request::new(Command::Shutdown),
    }
}

fn run(cli: &Cli) -> anyhow::Result<bool> {
    let request = build_request(&cli.command);
    let mut client = ControlClient::connect(&cli.socket)?;
    let (response, raw) = client.call(&request)?;

    if cli.json {
        println!("{raw}");
        return Ok(response.success);
    }

    if !response.success {
        match &response.message {
            Some(message) => eprintln!("Error: {} - {message}", response.error),
            None => eprintln!("Error: {}", response.error),
        }
        return Ok(false);
    }

    let data = response.data.unwrap_or(serde_json::Value::Null);
    match &cli.command {
        CliCommand::Status => output::print_status(&data),
        CliCommand::Stats => output::print_stats(&data),
        CliCommand::Events { .. } => output::print_events(&data),
        CliCommand::Rules { validate: false } => output::print_rules(&data),
        _ => {
            if !cli.quiet {
                if let Some(message) = &response.message {
                    println!("{message}");
                }
            }
        }
    }
    Ok(true)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(&cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
