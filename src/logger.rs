//! Structured logger: human-readable lines on stdout, JSON lines to an
//! optional file.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Utc;
use log::{LevelFilter, Log, Metadata, Record};
use serde_json::json;

use crate::config::LogConfig;

pub struct StructuredLogger {
    log_file: Option<Mutex<File>>,
    log_to_stdout: bool,
    max_level: LevelFilter,
}

impl StructuredLogger {
    fn new(config: &LogConfig, max_level: LevelFilter) -> Result<StructuredLogger, io::Error> {
        let log_file = if config.path.is_empty() {
            None
        } else {
            let file = OpenOptions::new().create(true).append(true).open(&config.path)?;
            Some(Mutex::new(file))
        };
        Ok(StructuredLogger { log_file, log_to_stdout: config.stdout, max_level })
    }

    /// Install as the global logger.
    pub fn init(config: &LogConfig) -> Result<()> {
        let max_level = config.level.parse::<LevelFilter>().unwrap_or(LevelFilter::Info);
        let logger = Self::new(config, max_level)
            .with_context(|| format!("Failed to open log file '{}'", config.path))?;
        log::set_boxed_logger(Box::new(logger)).context("Failed to set global logger")?;
        log::set_max_level(max_level);
        Ok(())
    }
}

impl Log for StructuredLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let timestamp = Utc::now();

        if self.log_to_stdout {
            let (color, level) = match record.level() {
                log::Level::Error => ("\x1b[31m", "ERROR"),
                log::Level::Warn => ("\x1b[33m", "WARN "),
                log::Level::Info => ("\x1b[32m", "INFO "),
                log::Level::Debug => ("\x1b[34m", "DEBUG"),
                log::Level::Trace => ("\x1b[35m", "TRACE"),
            };
            println!(
                "{} {}{}\x1b[0m [{}] {}",
                timestamp.format("%H:%M:%S%.3f"),
                color,
                level,
                record.target(),
                record.args()
            );
        }

        if let Some(file) = &self.log_file {
            if let Ok(mut guard) = file.lock() {
                let line = json!({
                    "timestamp": timestamp.to_rfc3339(),
                    "level": record.level().to_string(),
                    "target": record.target(),
                    "message": record.args().to_string(),
                });
                if let Ok(encoded) = serde_json::to_string(&line) {
                    let _ = writeln!(guard, "{}", encoded);
                }
            }
        }
    }

    fn flush(&self) {
        if let Some(file) = &self.log_file {
            if let Ok(mut guard) = file.lock() {
                let _ = guard.flush();
            }
        }
        let _ = io::stdout().flush();
    }
}
