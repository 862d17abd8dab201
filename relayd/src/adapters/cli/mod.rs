// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::PathBuf;

use clap::{CommandFactory, FromArgMatches, Parser};

#[derive(Parser, Debug)]
#[command(
    name = "relayd",
    version,
    about,
    long_about = None,
    after_help = "relayd dispatches batch jobs to a Slurm cluster over SSH, tracks their status and ingests their telemetry.\n\
\n\
Configuration precedence: defaults < config file < command-line flags.\n\
Config path precedence: defaults < RELAY_CONFIG_PATH < command-line flags.\n\
If --config is omitted, relayd tries RELAY_CONFIG_PATH, then the default config file location; a missing default config is OK.\n\
Paths in the config file are resolved relative to the config file directory; paths passed as flags are resolved relative to the current working directory."
)]
pub struct Opts {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to a TOML config file. When omitted, relayd uses RELAY_CONFIG_PATH if set, otherwise the default config file location if available."
    )]
    pub config: Option<PathBuf>,
    #[arg(
        long,
        value_name = "PATH",
        help = "Path to the SQLite database file. Overrides `database_path` from the config file."
    )]
    pub database_path: Option<PathBuf>,
    #[arg(
        long,
        value_name = "SECS",
        help = "How often to reconcile job states with the scheduler. Overrides `job_check_interval_secs` from the config file."
    )]
    pub job_check_interval_secs: Option<u64>,
    #[arg(
        long,
        value_name = "URL",
        help = "NATS server to read telemetry from. Overrides `telemetry.nats_url` and enables telemetry ingestion."
    )]
    pub nats_url: Option<String>,
    #[arg(
        long,
        action = clap::ArgAction::SetTrue,
        conflicts_with = "nats_url",
        help = "Run the job monitor only. Overrides `telemetry.enabled` from the config file."
    )]
    pub no_telemetry: bool,
    #[arg(
        short,
        long,
        action = clap::ArgAction::SetTrue,
        help = "Enable debug logging and include logs from dependencies. Overrides `verbose` from the config file."
    )]
    pub verbose: bool,
}

pub struct ParsedOpts {
    pub opts: Opts,
    pub verbose_override: Option<bool>,
    pub telemetry_override: Option<bool>,
}

impl ParsedOpts {
    fn from_opts(opts: Opts) -> Self {
        let verbose_override = opts.verbose.then_some(true);
        let telemetry_override = if opts.no_telemetry {
            Some(false)
        } else if opts.nats_url.is_some() {
            Some(true)
        } else {
            None
        };
        Self {
            opts,
            verbose_override,
            telemetry_override,
        }
    }
}

pub fn cli_command() -> clap::Command {
    Opts::command()
}

pub fn parse_opts() -> ParsedOpts {
    let matches = cli_command().get_matches();
    let opts = Opts::from_arg_matches(&matches).unwrap_or_else(|err| err.exit());
    ParsedOpts::from_opts(opts)
}
