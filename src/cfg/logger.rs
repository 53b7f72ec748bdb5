// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{
    EnvFilter, Layer, Registry, fmt, fmt::writer::BoxMakeWriter,
    layer::SubscriberExt,
};

#[derive(Debug, Deserialize)]
struct LoggerFile {
    logger: LoggerSettings,
}

/// Logging knobs under the `logger:` key. Lines go to stderr unless a file
/// path is given.
#[derive(Debug, Deserialize)]
struct LoggerSettings {
    level: String,
    #[serde(default)]
    json: bool,
    file: Option<PathBuf>,
    #[serde(default)]
    rotation: Rotate,
}

#[derive(Debug, Deserialize, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
enum Rotate {
    Minutely,
    Hourly,
    Daily,
    #[default]
    Never,
}

impl Rotate {
    fn appender(self, path: &Path) -> RollingFileAppender {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let leaf = path.file_name().unwrap_or_default();
        let rotation = match self {
            Self::Minutely => Rotation::MINUTELY,
            Self::Hourly => Rotation::HOURLY,
            Self::Daily => Rotation::DAILY,
            Self::Never => Rotation::NEVER,
        };
        RollingFileAppender::new(rotation, dir, leaf)
    }
}

impl LoggerSettings {
    fn writer(&self) -> (BoxMakeWriter, WorkerGuard) {
        let (writer, guard) = match &self.file {
            Some(path) => tracing_appender::non_blocking(self.rotation.appender(path)),
            None => tracing_appender::non_blocking(std::io::stderr()),
        };
        (BoxMakeWriter::new(writer), guard)
    }
}

/// Install the global subscriber from a YAML logger config. The returned
/// guard must outlive the program for buffered lines to be flushed.
pub fn init_logger(config_path: &str) -> Result<WorkerGuard> {
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read logger config {config_path}"))?;
    let settings = serde_yaml::from_str::<LoggerFile>(&content)
        .with_context(|| format!("failed to parse logger config {config_path}"))?
        .logger;

    let (writer, guard) = settings.writer();

    let env_filter = EnvFilter::try_new(&settings.level)
        .or_else(|_| EnvFilter::try_from_default_env())
        .context("no usable log level in the config or the environment")?;

    let fmt_layer = if settings.json {
        fmt::layer().with_writer(writer).with_ansi(false).json().boxed()
    } else {
        fmt::layer().with_writer(writer).with_ansi(false).boxed()
    };

    let subscriber = Registry::default().with(env_filter).with(fmt_layer);

    tracing::subscriber::set_global_default(subscriber)
        .context("a global subscriber is already installed")?;

    Ok(guard)
}

/// Plain stderr logging driven by `RUST_LOG`; the fallback when no logger
/// config file is around.
pub fn init_default_logger() -> Result<WorkerGuard> {
    let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = Registry::default()
        .with(env_filter)
        .with(fmt::layer().with_writer(writer).with_ansi(false));

    tracing::subscriber::set_global_default(subscriber)
        .context("a global subscriber is already installed")?;

    Ok(guard)
}
