// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{
    EnvFilter, Registry,
    fmt,
    fmt::writer::BoxMakeWriter,
    layer::SubscriberExt,
};

/// Installs the global subscriber. `logfile` of `-` logs to stdout;
/// anything else is treated as a file path. `RUST_LOG` overrides the level
/// derived from the debug flag. Keep the returned guard alive for the whole
/// process, or buffered log lines are lost.
pub fn init_logger(logfile: &str, debug: bool) -> Result<WorkerGuard> {
    let (writer, guard) = make_writer(logfile)?;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }));

    let fmt_layer = fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_ansi(logfile == "-");

    let subscriber = Registry::default().with(env_filter).with(fmt_layer);

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set global default subscriber")?;

    Ok(guard)
}

fn make_writer(logfile: &str) -> Result<(BoxMakeWriter, WorkerGuard)> {
    Ok(if logfile == "-" {
        let (w, g) = tracing_appender::non_blocking(std::io::stdout());
        (BoxMakeWriter::new(w), g)
    } else {
        let path = PathBuf::from(logfile);
        let dir = path.parent().unwrap_or_else(|| Path::new(""));
        let file_appender = RollingFileAppender::new(
            Rotation::NEVER,
            dir,
            path.file_name().unwrap_or_default(),
        );
        let (w, g) = tracing_appender::non_blocking(file_appender);
        (BoxMakeWriter::new(w), g)
    })
}
