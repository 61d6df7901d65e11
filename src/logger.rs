//! Logging infrastructure for torctl-rs.
//!
//! Built on the tracing ecosystem, with output to stdout, a file or syslog.
//! Library code logs through [`plog`], which maps torctl-rs's five levels
//! onto tracing's macros; nothing is printed until [`init`] installs a
//! subscriber.
//!
//! # Log Levels
//!
//! | Level | Used for |
//! |-------|----------|
//! | [`Debug`](crate::LogLevel::Debug) | Wire lines, per-connection proxy traffic |
//! | [`Info`](crate::LogLevel::Info) | Connection setup and teardown |
//! | [`Notice`](crate::LogLevel::Notice) | Session, proxy and process lifecycle (default) |
//! | [`Warn`](crate::LogLevel::Warn) | Lost sessions, unexpected exits, panicking subscribers |
//! | [`Error`](crate::LogLevel::Error) | Fatal startup failures |
//!
//! # Example
//!
//! ```rust,no_run
//! use torctl_rs::{LogLevel, logger};
//!
//! // Log to stdout
//! logger::init(LogLevel::Notice, None).unwrap();
//!
//! // Or to a file, or to syslog
//! // logger::init(LogLevel::Debug, Some("/var/log/torctl.log")).unwrap();
//! // logger::init(LogLevel::Notice, Some(":syslog:")).unwrap();
//!
//! logger::plog(LogLevel::Notice, "Event session established");
//! ```
//!
//! The `RUST_LOG` environment variable overrides the configured level.

use std::io::Write;
use std::os::unix::net::UnixDatagram;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, error, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use crate::config::LogLevel;
use crate::error::{Error, Result};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

const SYSLOG_PREFIX: &str = "torctl: ";

/// Initialize the logging system.
///
/// Subsequent calls are no-ops.
///
/// # Arguments
///
/// * `level` - The minimum log level to output
/// * `logfile` - Output destination:
///   - `None` - Log to stdout with ANSI colors
///   - `Some(":syslog:")` - Log to system syslog
///   - `Some(path)` - Append to the file at `path`
///
/// # Errors
///
/// Returns [`Error::Config`] if no syslog socket exists, the log file cannot
/// be opened, or a global subscriber is already installed.
pub fn init(level: LogLevel, logfile: Option<&str>) -> Result<()> {
    if LOGGER_INITIALIZED.get().is_some() {
        return Ok(());
    }

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_for(level)));

    match logfile {
        None => {
            let subscriber = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_thread_ids(false)
                .with_span_events(FmtSpan::NONE)
                .with_ansi(true)
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| Error::Config(format!("failed to set logger: {}", e)))?;
        }
        Some(":syslog:") => {
            init_syslog(env_filter)?;
        }
        Some(path) => {
            init_file_logger(Path::new(path), env_filter)?;
        }
    }

    LOGGER_INITIALIZED.get_or_init(|| ());
    Ok(())
}

/// tracing has no notice level; Notice shares `info`.
fn filter_for(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Debug => "debug",
        LogLevel::Info | LogLevel::Notice => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    }
}

fn init_syslog(env_filter: EnvFilter) -> Result<()> {
    let syslog_path = ["/dev/log", "/var/run/syslog"]
        .into_iter()
        .find(|p| Path::new(p).exists())
        .ok_or_else(|| Error::Config("no syslog socket found".to_string()))?;

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_ansi(false)
        .with_writer(move || SyslogWriter::connect(syslog_path))
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::Config(format!("failed to set logger: {}", e)))?;

    Ok(())
}

/// Sends each formatted record as one datagram. Records are dropped while
/// the syslog socket is unreachable.
struct SyslogWriter {
    socket: Option<UnixDatagram>,
}

impl SyslogWriter {
    fn connect(path: &str) -> Self {
        let socket = UnixDatagram::unbound()
            .and_then(|sock| sock.connect(path).map(|_| sock))
            .ok();
        Self { socket }
    }
}

fn syslog_record(buf: &[u8]) -> String {
    format!("{}{}", SYSLOG_PREFIX, String::from_utf8_lossy(buf).trim_end())
}

impl Write for SyslogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Some(socket) = &self.socket {
            socket.send(syslog_record(buf).as_bytes())?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn init_file_logger(path: &Path, env_filter: EnvFilter) -> Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| Error::Config(format!("log path {} has no file name", path.display())))?;
    let directory = path
        .parent()
        .filter(|d| !d.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(file_name.to_string_lossy())
        .build(directory)
        .map_err(|e| Error::Config(format!("cannot open log file {}: {}", path.display(), e)))?;

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_ansi(false)
        .with_writer(appender)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::Config(format!("failed to set logger: {}", e)))?;

    Ok(())
}

/// Log a message at the specified level.
///
/// | LogLevel | tracing macro |
/// |----------|---------------|
/// | Debug | `debug!` |
/// | Info | `info!` |
/// | Notice | `info!` |
/// | Warn | `warn!` |
/// | Error | `error!` |
///
/// # Example
///
/// ```rust
/// use torctl_rs::{LogLevel, logger};
///
/// logger::plog(LogLevel::Notice, "Web proxy listening");
/// logger::plog(LogLevel::Warn, "Lost the event session with tor");
/// ```
pub fn plog(level: LogLevel, message: &str) {
    match level {
        LogLevel::Debug => debug!("{}", message),
        LogLevel::Info => info!("{}", message),
        LogLevel::Notice => info!("{}", message),
        LogLevel::Warn => warn!("{}", message),
        LogLevel::Error => error!("{}", message),
    }
}

/// Log a formatted message at the specified level.
///
/// # Example
///
/// ```rust
/// use torctl_rs::{LogLevel, plog_fmt};
///
/// plog_fmt!(LogLevel::Notice, "Connected to tor {}", "0.4.8.10");
/// plog_fmt!(LogLevel::Debug, "{} circuits tracked", 4);
/// ```
#[macro_export]
macro_rules! plog_fmt {
    ($level:expr, $($arg:tt)*) => {
        $crate::logger::plog($level, &format!($($arg)*))
    };
}
