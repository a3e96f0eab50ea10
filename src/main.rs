// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::process::ExitCode;

use clap::Parser;
use httptun::{
    cfg::{
        cli::{Cli, resolve_config_path},
        config::{Config, Mode},
        logger::init_logger,
    },
    client, server, util,
};
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    // Run unprivileged except for the bracketed interface/route/port work.
    util::dropprivs("");

    let cli = Cli::parse();

    let cfgfile = match resolve_config_path(&cli.cfgfile) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("fatal: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    let mut config = match Config::load_from_file(&cfgfile) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("fatal: reading cfgfile {}: {e:#}", cfgfile.display());
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = cli.apply(&mut config) {
        eprintln!("fatal: {e:#}");
        return ExitCode::FAILURE;
    }

    if cli.configtest {
        println!("{config:#?}");
        return ExitCode::SUCCESS;
    }

    let _log_guard = match init_logger(&config.logfile, config.debug) {
        Ok(g) => g,
        Err(e) => {
            eprintln!("warning: could not open logfile {}: {e:#}", config.logfile);
            return ExitCode::FAILURE;
        }
    };

    info!("httptund {} started", env!("CARGO_PKG_VERSION"));

    let mode = match config.mode() {
        Ok(m) => m,
        Err(e) => {
            error!("fatal: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    let run = match mode {
        Mode::Server => server::server_main(config, &cfgfile).await,
        Mode::Client => client::client_main(config, &cfgfile).await,
    };
    match run {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}
