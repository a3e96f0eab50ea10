// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;

use crate::cfg::config::{Config, Mode};

/// IP-over-HTTP tunnel daemon.
#[derive(Parser, Debug)]
#[command(name = "httptund", version, about, disable_version_flag = true)]
pub struct Cli {
    /// Use cfgfile as the config file.
    #[arg(short = 'c', long = "config", default_value = "/etc/httptund.yaml")]
    pub cfgfile: String,

    /// Print the version information and exit.
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    pub version: Option<bool>,

    /// Run in the foreground (the default; kept for compatibility with
    /// init scripts that pass it).
    #[arg(short = 'f', long)]
    pub foreground: bool,

    /// Include debug-level messages in the log.
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Use this TUN interface name instead of a kernel-assigned one.
    #[arg(short = 't', long = "tun-name")]
    pub tun_name: Option<String>,

    /// Log output file. Give - for stdout.
    #[arg(short = 'l', long = "logfile")]
    pub logfile: Option<String>,

    /// Do not alter the default route.
    #[arg(short = 'r', long = "no-route")]
    pub no_route: bool,

    /// Override the primary server port (server) or proxy port (client).
    #[arg(short = 'p', long = "port")]
    pub port: Option<u16>,

    /// Configtest only: check config syntax, print it, and exit.
    #[arg(short = 'o', long = "configtest")]
    pub configtest: bool,
}

impl Cli {
    /// Command-line values win over config-file values.
    pub fn apply(&self, config: &mut Config) -> Result<()> {
        if self.debug {
            config.debug = true;
        }
        if let Some(name) = &self.tun_name {
            config.tun_name = Some(name.clone());
        }
        if let Some(logfile) = &self.logfile {
            config.logfile = logfile.clone();
        }
        match config.mode()? {
            Mode::Server => {
                if let (Some(port), Some(s)) = (self.port, config.server.as_mut()) {
                    s.server_ports[0] = port;
                }
            }
            Mode::Client => {
                if let Some(c) = config.client.as_mut() {
                    if let Some(port) = self.port {
                        c.proxy_port = port;
                    }
                    if self.no_route {
                        c.do_routing = false;
                    }
                }
            }
        }
        Ok(())
    }
}

pub fn resolve_config_path(rel: &str) -> Result<PathBuf> {
    let p = Path::new(rel);

    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .context("cannot get current working dir")?
            .join(p)
    };

    let canon = abs
        .canonicalize()
        .with_context(|| format!("failed to canonicalize path {abs:?}"))?;

    Ok(canon)
}
