//! Logging module.
//!
//! The terminal belongs to the UI, so log output goes to a file: the one
//! named by the `LOG_FILE` environment variable, or [`DEFAULT_LOG_FILE`].
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::sync::Mutex;
use std::{env, path::PathBuf};

use chrono::prelude::*;
use log::{Level, Log, Metadata, Record, SetLoggerError};

/// Default log file path, relative to the working directory.
pub const DEFAULT_LOG_FILE: &str = "chat.log";

struct Logger {
    level: Level,
    file: Mutex<File>,
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let message = format!(
                "{} {:<5} {:<8} {}",
                Local::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                record.level(),
                record.target(),
                record.args()
            );
            if let Ok(mut file) = self.file.lock() {
                writeln!(file, "{message}").ok();
            }
        }
    }

    fn flush(&self) {
        if let Ok(mut file) = self.file.lock() {
            file.flush().ok();
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("couldn't open log file: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    SetLogger(#[from] SetLoggerError),
}

/// The log file path configured in the environment.
pub fn path() -> PathBuf {
    env::var("LOG_FILE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_LOG_FILE))
}

/// Initialize a new logger writing to the configured log file.
pub fn init(level: Level) -> Result<(), Error> {
    let file = OpenOptions::new().create(true).append(true).open(path())?;
    let logger = Logger {
        level,
        file: Mutex::new(file),
    };

    log::set_boxed_logger(Box::new(logger))?;
    log::set_max_level(level.to_level_filter());

    Ok(())
}

/// Get the level set by the environment variable `RUST_LOG`, if present.
pub fn env_level() -> Option<Level> {
    let level = std::env::var("RUST_LOG").ok()?;
    level.parse().ok()
}
