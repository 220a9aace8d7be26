//! Logger setup from the `logging` configuration section.
//!
//! Lines look like `2025-01-01T10:00:00Z | edubot::bootstrap [INFO] message`.
//! `RUST_LOG` takes precedence over `logging.level`.

use std::{
    fs::OpenOptions,
    io::{self, Write},
};

use anyhow::Context;
use env_logger::{Builder, Env, Target};

use crate::config::Logging;

/// Where log lines are written.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LogSink {
    Console,
    File(String),
    Both(String),
    Disabled,
}

impl LogSink {
    fn from_config(logging: &Logging) -> Self {
        let file = &logging.file_logging;
        match (logging.console_logging.enabled, file.enabled) {
            (true, false) => LogSink::Console,
            (false, true) => LogSink::File(file.filepath.clone()),
            (true, true) => LogSink::Both(file.filepath.clone()),
            (false, false) => LogSink::Disabled,
        }
    }

    fn target(&self) -> anyhow::Result<Target> {
        let target = match self {
            LogSink::Console => Target::Stdout,
            LogSink::File(path) => Target::Pipe(Box::new(open_log_file(path)?)),
            LogSink::Both(path) => Target::Pipe(Box::new(Tee {
                first: io::stdout(),
                second: open_log_file(path)?,
            })),
            LogSink::Disabled => Target::Pipe(Box::new(io::sink())),
        };
        Ok(target)
    }
}

fn open_log_file(path: &str) -> anyhow::Result<std::fs::File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("cannot open log file {path}"))
}

/// Writes everything to two writers.
struct Tee<A: Write, B: Write> {
    first: A,
    second: B,
}

impl<A: Write, B: Write> Write for Tee<A, B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.first.write_all(buf)?;
        self.second.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.first.flush()?;
        self.second.flush()
    }
}

/// Installs the global logger.
///
/// # Errors
///
/// Returns an error if the level is unknown, the log file cannot be opened, or
/// a logger is already installed.
pub fn init(logging: &Logging) -> anyhow::Result<()> {
    let level = logging.level_filter()?.to_string().to_lowercase();
    let sink = LogSink::from_config(logging);

    let env = Env::default().filter_or("RUST_LOG", level);
    let mut builder = Builder::from_env(env);
    if sink == LogSink::Disabled {
        builder.filter_level(log::LevelFilter::Off);
    }

    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{} | {} [{}] {}",
                buf.timestamp(),
                record.target(),
                record.level(),
                record.args()
            )
        })
        .target(sink.target()?)
        .try_init()
        .context("a logger is already installed")
}
