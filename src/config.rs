//! Configuration management for torctl-rs.
//!
//! Configuration comes from a TOML file, command-line arguments and
//! environment variables, applied in order: defaults → config file →
//! environment/CLI, with later sources overriding earlier ones.
//!
//! # Configuration Flow
//!
//! ```text
//!     ┌─────────────────┐
//!     │ Config::default │ ◄── Built-in defaults
//!     └────────┬────────┘
//!              │
//!              ▼
//!     ┌─────────────────┐     ┌─────────────────┐
//!     │ Config file     │ ◄───│ torctl.conf     │  (TOML, if present)
//!     │ exists?         │     │ or --config     │
//!     └────────┬────────┘     └─────────────────┘
//!              │
//!              ▼
//!     ┌─────────────────┐     ┌─────────────────┐
//!     │ Apply env + CLI │ ◄───│ --control-port  │
//!     │ (override)      │     │ TORCTL_TOR_PATH │
//!     └────────┬────────┘     └─────────────────┘
//!              │
//!              ▼
//!     ┌─────────────────┐
//!     │ Validate        │
//!     └─────────────────┘
//! ```
//!
//! # Example Configuration File
//!
//! ```toml
//! # Control port
//! control_ip = "127.0.0.1"
//! control_port = 9051
//! # control_pass = "my_password"
//!
//! # Ports handed to tor and used by the proxy
//! socks_port = 9050
//! proxy_port = 8182
//! proxy_enabled = true
//!
//! # Launch tor instead of attaching to a running one
//! # tor_path = "/usr/bin/tor"
//! # torrc = "/etc/tor/torrc"
//! # defaults_torrc = "/usr/share/tor/tor-service-defaults-torrc"
//! startup_delay_ms = 500
//!
//! # Logging
//! loglevel = "notice"  # debug, info, notice, warn, error
//! # logfile = "/var/log/torctl.log"
//! # logfile = ":syslog:"
//!
//! tracked_options = ["SocksPort", "ControlPort", "ExitNodes"]
//! ```

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::client::DEFAULT_TRACKED_OPTIONS;
use crate::error::{Error, Result};
use crate::proxy::DEFAULT_PROXY_PORT;

/// Log level for torctl-rs output.
///
/// From most to least verbose:
/// [`Debug`](LogLevel::Debug) > [`Info`](LogLevel::Info) > [`Notice`](LogLevel::Notice) >
/// [`Warn`](LogLevel::Warn) > [`Error`](LogLevel::Error)
///
/// The same levels name Tor's log events (`DEBUG` … `ERR`).
///
/// # Example
///
/// ```rust
/// use torctl_rs::LogLevel;
///
/// let level = LogLevel::Notice;
/// assert!(level < LogLevel::Warn);
/// assert_eq!("ERR".parse::<LogLevel>().unwrap(), LogLevel::Error);
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Low-level debugging information.
    Debug,
    /// Informational messages about normal operation.
    Info,
    /// Notable events that may be of interest.
    #[default]
    Notice,
    /// Warning conditions that don't prevent operation.
    Warn,
    /// Error conditions that may impair functionality.
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Notice => write!(f, "NOTICE"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "NOTICE" => Ok(LogLevel::Notice),
            "WARN" | "WARNING" => Ok(LogLevel::Warn),
            "ERROR" | "ERR" => Ok(LogLevel::Error),
            _ => Err(Error::Config(format!("invalid log level: {}", s))),
        }
    }
}

/// Main configuration structure for torctl-rs.
///
/// # Fields
///
/// | Field | Type | Default | Description |
/// |-------|------|---------|-------------|
/// | `control_ip` | `String` | `"127.0.0.1"` | Control port host |
/// | `control_port` | `u16` | `9051` | Control port number |
/// | `control_pass` | `Option<String>` | `None` | AUTHENTICATE password |
/// | `socks_port` | `u16` | `9050` | Tor SOCKS port |
/// | `proxy_port` | `u16` | `8182` | Local HTTP proxy port |
/// | `proxy_enabled` | `bool` | `true` | Run the HTTP proxy |
/// | `tor_path` | `Option<PathBuf>` | `None` | Launch this tor instead of attaching |
/// | `torrc` | `Option<PathBuf>` | `None` | torrc for a launched tor |
/// | `defaults_torrc` | `Option<PathBuf>` | `None` | defaults torrc for a launched tor |
/// | `startup_delay_ms` | `u64` | `500` | Wait after launching tor |
/// | `loglevel` | `LogLevel` | `Notice` | Log verbosity |
/// | `logfile` | `Option<String>` | `None` | File path, `:syslog:`, or stdout |
/// | `tracked_options` | `Vec<String>` | see [`DEFAULT_TRACKED_OPTIONS`] | Options cached on connect |
///
/// # Example
///
/// ```rust
/// use torctl_rs::Config;
///
/// let config = Config::default();
/// assert_eq!(config.control_port, 9051);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Host of the Tor control port.
    #[serde(default = "default_control_ip")]
    pub control_ip: String,
    /// Port number of the Tor control port.
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    /// Password for Tor control authentication.
    #[serde(default)]
    pub control_pass: Option<String>,
    /// Tor SOCKS port.
    #[serde(default = "default_socks_port")]
    pub socks_port: u16,
    /// Local HTTP proxy port.
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,
    /// Whether to run the HTTP proxy.
    #[serde(default = "default_proxy_enabled")]
    pub proxy_enabled: bool,
    /// Tor executable to launch. None attaches to a running tor.
    #[serde(default)]
    pub tor_path: Option<PathBuf>,
    /// torrc for a launched tor.
    #[serde(default)]
    pub torrc: Option<PathBuf>,
    /// Defaults torrc for a launched tor.
    #[serde(default)]
    pub defaults_torrc: Option<PathBuf>,
    /// Milliseconds to wait after launching tor.
    #[serde(default = "default_startup_delay_ms")]
    pub startup_delay_ms: u64,
    /// Log level for output.
    #[serde(default)]
    pub loglevel: LogLevel,
    /// Log file path. None for stdout, ":syslog:" for syslog.
    #[serde(default)]
    pub logfile: Option<String>,
    /// Configuration names fetched when the client connects.
    #[serde(default = "default_tracked_options")]
    pub tracked_options: Vec<String>,
}

fn default_control_ip() -> String {
    "127.0.0.1".to_string()
}
fn default_control_port() -> u16 {
    9051
}
fn default_socks_port() -> u16 {
    9050
}
fn default_proxy_port() -> u16 {
    DEFAULT_PROXY_PORT
}
fn default_proxy_enabled() -> bool {
    true
}
fn default_startup_delay_ms() -> u64 {
    500
}
fn default_tracked_options() -> Vec<String> {
    DEFAULT_TRACKED_OPTIONS.iter().map(|s| s.to_string()).collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            control_ip: default_control_ip(),
            control_port: default_control_port(),
            control_pass: None,
            socks_port: default_socks_port(),
            proxy_port: default_proxy_port(),
            proxy_enabled: default_proxy_enabled(),
            tor_path: None,
            torrc: None,
            defaults_torrc: None,
            startup_delay_ms: default_startup_delay_ms(),
            loglevel: LogLevel::default(),
            logfile: None,
            tracked_options: default_tracked_options(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read.
    /// Returns [`Error::Config`] if the TOML is invalid.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Serialize configuration to TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a zero port, two features sharing a
    /// port, an empty control host or an empty tracked option name.
    pub fn validate(&self) -> Result<()> {
        if self.control_ip.trim().is_empty() {
            return Err(Error::Config("control_ip must not be empty".to_string()));
        }
        for (name, port) in [
            ("control_port", self.control_port),
            ("socks_port", self.socks_port),
            ("proxy_port", self.proxy_port),
        ] {
            if port == 0 {
                return Err(Error::Config(format!("{} must be between 1 and 65535", name)));
            }
        }
        if self.control_port == self.socks_port {
            return Err(Error::Config(
                "control_port and socks_port must differ".to_string(),
            ));
        }
        if self.proxy_enabled
            && (self.proxy_port == self.socks_port || self.proxy_port == self.control_port)
        {
            return Err(Error::Config(format!(
                "proxy_port {} is already used by tor",
                self.proxy_port
            )));
        }
        if self.tracked_options.iter().any(|name| name.trim().is_empty()) {
            return Err(Error::Config(
                "tracked_options must not contain empty names".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns true when the binary should launch its own tor.
    pub fn launches_tor(&self) -> bool {
        self.tor_path.is_some()
    }
}

/// Command-line arguments for torctl-rs.
///
/// Arguments override configuration file values.
///
/// # Environment Variables
///
/// - `TORCTL_CONFIG`: configuration file (equivalent to `--config`)
/// - `TORCTL_CONTROL_PASS`: control password (equivalent to `--control-pass`)
/// - `TORCTL_TOR_PATH`: tor executable (equivalent to `--tor-path`)
///
/// # Examples
///
/// Attach to a running tor:
/// ```bash
/// torctl-rs --control-port 9051 --control-pass secret
/// ```
///
/// Launch tor and serve the proxy on another port:
/// ```bash
/// torctl-rs --tor-path /usr/bin/tor --proxy-port 8118
/// ```
///
/// Generate a default configuration file:
/// ```bash
/// torctl-rs --generate_config torctl.conf
/// ```
#[derive(Parser, Debug)]
#[command(name = "torctl-rs")]
#[command(about = "Tor control client with an HTTP-to-SOCKS proxy")]
#[command(version)]
pub struct CliArgs {
    /// Write default config to file and exit.
    #[arg(long = "generate_config")]
    pub generate_config: Option<PathBuf>,

    /// Path to configuration file.
    ///
    /// TOML configuration file containing all settings. Command-line arguments
    /// override values from this file.
    #[arg(long = "config", env = "TORCTL_CONFIG", default_value = "torctl.conf")]
    pub config_file: PathBuf,

    /// Log verbosity (DEBUG, INFO, NOTICE, WARN, ERROR).
    #[arg(long)]
    pub loglevel: Option<String>,

    /// Log to file instead of stdout (use ":syslog:" for syslog).
    #[arg(long)]
    pub logfile: Option<String>,

    /// Host of the Tor control port.
    #[arg(long)]
    pub control_ip: Option<String>,

    /// Tor control port number.
    #[arg(long)]
    pub control_port: Option<u16>,

    /// Tor control port password.
    #[arg(long, env = "TORCTL_CONTROL_PASS")]
    pub control_pass: Option<String>,

    /// Tor SOCKS port number.
    #[arg(long)]
    pub socks_port: Option<u16>,

    /// Local HTTP proxy port.
    #[arg(long)]
    pub proxy_port: Option<u16>,

    /// Do not start the HTTP proxy.
    #[arg(long)]
    pub disable_proxy: bool,

    /// Launch this tor executable instead of attaching to a running one.
    #[arg(long, env = "TORCTL_TOR_PATH")]
    pub tor_path: Option<PathBuf>,

    /// torrc passed to a launched tor.
    #[arg(long)]
    pub torrc: Option<PathBuf>,

    /// Defaults torrc passed to a launched tor.
    #[arg(long)]
    pub defaults_torrc: Option<PathBuf>,
}

impl CliArgs {
    /// Apply CLI arguments to a configuration, overriding values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an unknown log level.
    pub fn apply_to(&self, config: &mut Config) -> Result<()> {
        if let Some(ref loglevel) = self.loglevel {
            config.loglevel = loglevel.parse()?;
        }
        if let Some(ref logfile) = self.logfile {
            config.logfile = Some(logfile.clone());
        }
        if let Some(ref control_ip) = self.control_ip {
            config.control_ip = control_ip.clone();
        }
        if let Some(control_port) = self.control_port {
            config.control_port = control_port;
        }
        if let Some(ref control_pass) = self.control_pass {
            config.control_pass = Some(control_pass.clone());
        }
        if let Some(socks_port) = self.socks_port {
            config.socks_port = socks_port;
        }
        if let Some(proxy_port) = self.proxy_port {
            config.proxy_port = proxy_port;
        }
        if self.disable_proxy {
            config.proxy_enabled = false;
        }
        if let Some(ref tor_path) = self.tor_path {
            config.tor_path = Some(tor_path.clone());
        }
        if let Some(ref torrc) = self.torrc {
            config.torrc = Some(torrc.clone());
        }
        if let Some(ref defaults_torrc) = self.defaults_torrc {
            config.defaults_torrc = Some(defaults_torrc.clone());
        }
        Ok(())
    }
}

/// Load configuration from file and CLI arguments.
///
/// 1. Start with defaults
/// 2. Apply config file if it exists
/// 3. Apply CLI arguments and environment (override)
///
/// # Errors
///
/// Returns [`Error::Config`] if configuration is invalid.
pub fn load_config(args: &CliArgs) -> Result<Config> {
    let mut config = Config::default();

    if args.config_file.exists() {
        config = Config::from_file(&args.config_file)?;
    }

    args.apply_to(&mut config)?;
    config.validate()?;

    Ok(config)
}

/// Writes the default configuration as TOML to `path`.
///
/// # Errors
///
/// Returns [`Error::Io`] if the file cannot be written.
pub fn generate_config(path: &Path) -> Result<()> {
    std::fs::write(path, Config::default().to_toml()?)?;
    Ok(())
}
