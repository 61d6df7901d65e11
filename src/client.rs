//! High-level client combining every torctl-rs component.
//!
//! [`Client`] either launches a Tor process or attaches to one that is
//! already running, then keeps three things alive for as long as it exists:
//!
//! - an [`EventSession`] feeding a [`StatusRegistry`]
//! - a configuration cache kept current from `CONF_CHANGED` events
//! - an optional [`ProxyListener`] forwarding HTTP clients into Tor
//!
//! # Lifecycle
//!
//! ```text
//! ┌──────────────────┐
//! │ create/connect() │ ◄── launch tor (create only), wait startup delay
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │  EventSession    │ ◄── ready step: GETCONF tracked options
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │  version check   │ ◄── below 0.2.0.9 fails the client
//! └────────┬─────────┘
//!          ▼
//! ┌──────────────────┐
//! │ registry, proxy  │ ◄── runs until shutdown() or a lost session/process
//! └──────────────────┘
//! ```
//!
//! Session and process failures are not returned from any call. They are
//! published once through [`Client::shutdown_notifications`].
//!
//! # Example
//!
//! ```rust,no_run
//! use torctl_rs::client::{Client, ClientOptions, ClientRemoteParams};
//!
//! # async fn demo() -> torctl_rs::Result<()> {
//! let params = ClientRemoteParams::new("127.0.0.1", 9051, "secret");
//! let mut client = Client::connect(params, ClientOptions::default()).await?;
//!
//! client.new_identity().await?;
//! println!("{:?}", client.get_config_value("SocksPort").await?);
//! for circuit in client.status().circuits() {
//!     println!("{} {}", circuit.id, circuit.status);
//! }
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use zeroize::Zeroize;

use crate::commands;
use crate::config::{Config, LogLevel};
use crate::connection::ControlEndpoint;
use crate::error::{Error, Result};
use crate::events::{EventKind, EventSession, SessionState, Subscription, TorEvent};
use crate::logger::plog;
use crate::proxy::{ProxyListener, DEFAULT_PROXY_PORT};
use crate::socks::{self, SocksTarget};
use crate::status::{self, RegistryAttachment, StatusRegistry};
use crate::version::TorVersion;

/// Oldest Tor release the client works with.
pub const MINIMUM_SUPPORTED_VERSION: TorVersion = TorVersion::new(0, 2, 0, 9);

/// Configuration names fetched when the event session becomes ready.
pub const DEFAULT_TRACKED_OPTIONS: &[&str] = &[
    "SocksPort",
    "ControlPort",
    "ExitNodes",
    "ExcludeNodes",
    "StrictNodes",
    "UseEntryGuards",
    "EnforceDistinctSubnets",
];

/// Default delay between launching Tor and opening the control port.
pub const DEFAULT_STARTUP_DELAY: Duration = Duration::from_millis(500);

/// How long a halted Tor may take to exit before it is killed.
const HALT_GRACE: Duration = Duration::from_secs(5);

/// A wrapper for sensitive password data that clears itself on drop.
///
/// Cloning creates an independent copy; each copy is zeroized when dropped.
/// Debug output shows `[REDACTED]` instead of the password.
///
/// # Example
///
/// ```rust
/// use torctl_rs::SecurePassword;
///
/// let password = SecurePassword::new("my_secret_password".to_string());
/// assert_eq!(password.as_str(), "my_secret_password");
///
/// let debug = format!("{:?}", password);
/// assert!(debug.contains("REDACTED"));
/// assert!(!debug.contains("my_secret"));
/// ```
#[derive(Clone, Default)]
pub struct SecurePassword(String);

impl SecurePassword {
    /// Creates a new secure password wrapper.
    pub fn new(password: String) -> Self {
        Self(password)
    }

    /// Returns a reference to the password string.
    ///
    /// Avoid converting the result into an owned `String`; the copy would
    /// not be zeroized.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true for an empty password.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Drop for SecurePassword {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for SecurePassword {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecurePassword([REDACTED])")
    }
}

/// Parameters for launching a Tor process.
#[derive(Debug, Clone)]
pub struct ClientCreateParams {
    /// Path to the tor executable.
    pub tor_path: PathBuf,
    /// Control port passed on the command line.
    pub control_port: u16,
    /// Password for AUTHENTICATE; must match the torrc's hashed password.
    pub control_password: SecurePassword,
    /// Optional torrc (`-f`).
    pub torrc: Option<PathBuf>,
    /// Optional defaults torrc (`--defaults-torrc`).
    pub defaults_torrc: Option<PathBuf>,
    /// SOCKS port passed on the command line.
    pub socks_port: u16,
    /// Extra `--Name value` pairs appended to the command line.
    pub overrides: Vec<(String, String)>,
}

impl ClientCreateParams {
    /// Creates parameters with the default ports and no torrc.
    pub fn new(tor_path: impl Into<PathBuf>) -> Self {
        Self {
            tor_path: tor_path.into(),
            control_port: 9051,
            control_password: SecurePassword::default(),
            torrc: None,
            defaults_torrc: None,
            socks_port: 9050,
            overrides: Vec::new(),
        }
    }

    /// Builds the tor command line, without the executable.
    ///
    /// ```rust
    /// use torctl_rs::client::ClientCreateParams;
    ///
    /// let params = ClientCreateParams::new("/usr/bin/tor");
    /// assert_eq!(
    ///     params.launch_arguments(),
    ///     vec![
    ///         "--ignore-missing-torrc", "--allow-missing-torrc",
    ///         "--ControlPort", "9051", "--SocksPort", "9050",
    ///     ]
    /// );
    /// ```
    pub fn launch_arguments(&self) -> Vec<String> {
        let mut args = vec![
            "--ignore-missing-torrc".to_string(),
            "--allow-missing-torrc".to_string(),
            "--ControlPort".to_string(),
            self.control_port.to_string(),
            "--SocksPort".to_string(),
            self.socks_port.to_string(),
        ];
        if let Some(torrc) = non_blank(&self.torrc) {
            args.push("-f".to_string());
            args.push(torrc.display().to_string());
        }
        if let Some(defaults) = non_blank(&self.defaults_torrc) {
            args.push("--defaults-torrc".to_string());
            args.push(defaults.display().to_string());
        }
        for (name, value) in &self.overrides {
            args.push(format!("--{}", name));
            args.push(value.clone());
        }
        args
    }

    fn validate(&self) -> Result<()> {
        if self.tor_path.as_os_str().is_empty() {
            return Err(Error::Validation("the tor executable path is empty".to_string()));
        }
        validate_ports(self.control_port, self.socks_port)?;
        if let Some((name, _)) = self.overrides.iter().find(|(n, _)| n.trim().is_empty()) {
            return Err(Error::Validation(format!("invalid override name: {:?}", name)));
        }
        Ok(())
    }
}

fn non_blank(path: &Option<PathBuf>) -> Option<&Path> {
    path.as_deref()
        .filter(|p| !p.as_os_str().to_string_lossy().trim().is_empty())
}

/// Parameters for attaching to a Tor process that is already running.
#[derive(Debug, Clone)]
pub struct ClientRemoteParams {
    /// Host of the control and SOCKS ports.
    pub address: String,
    /// Control port.
    pub control_port: u16,
    /// Password for AUTHENTICATE.
    pub control_password: SecurePassword,
    /// SOCKS port used by the proxy and [`Client::open_stream`].
    pub socks_port: u16,
}

impl ClientRemoteParams {
    /// Creates parameters with the default SOCKS port.
    pub fn new(address: impl Into<String>, control_port: u16, password: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            control_port,
            control_password: SecurePassword::new(password.into()),
            socks_port: 9050,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(Error::Validation("the remote address is empty".to_string()));
        }
        validate_ports(self.control_port, self.socks_port)
    }
}

fn validate_ports(control_port: u16, socks_port: u16) -> Result<()> {
    if control_port == 0 || socks_port == 0 {
        return Err(Error::Validation("ports must be between 1 and 65535".to_string()));
    }
    if control_port == socks_port {
        return Err(Error::Validation(format!(
            "control and SOCKS ports must differ (both {})",
            control_port
        )));
    }
    Ok(())
}

/// Behaviour shared by launched and attached clients.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Names fetched through GETCONF when the session is ready.
    pub tracked_options: Vec<String>,
    /// Whether to run the HTTP proxy.
    pub proxy_enabled: bool,
    /// HTTP proxy port on 127.0.0.1; 0 picks a free port.
    pub proxy_port: u16,
    /// Fixed wait after launching Tor.
    pub startup_delay: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            tracked_options: DEFAULT_TRACKED_OPTIONS.iter().map(|s| s.to_string()).collect(),
            proxy_enabled: true,
            proxy_port: DEFAULT_PROXY_PORT,
            startup_delay: DEFAULT_STARTUP_DELAY,
        }
    }
}

impl ClientOptions {
    /// Takes the client behaviour from a loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            tracked_options: config.tracked_options.clone(),
            proxy_enabled: config.proxy_enabled,
            proxy_port: config.proxy_port,
            startup_delay: Duration::from_millis(config.startup_delay_ms),
        }
    }
}

/// Why a client stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// [`Client::shutdown`] was called.
    Requested,
    /// The launched Tor exited on its own, with its exit code if it had one.
    UnexpectedExit(Option<i32>),
    /// The event session's connection was closed.
    SessionLost,
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownReason::Requested => write!(f, "shutdown requested"),
            ShutdownReason::UnexpectedExit(Some(code)) => {
                write!(f, "tor exited unexpectedly with code {}", code)
            }
            ShutdownReason::UnexpectedExit(None) => write!(f, "tor exited unexpectedly"),
            ShutdownReason::SessionLost => write!(f, "lost the event session"),
        }
    }
}

/// Cached configuration values keyed by lowercase name.
#[derive(Debug, Default)]
struct ConfigurationCache(Mutex<HashMap<String, Option<String>>>);

impl ConfigurationCache {
    fn values(&self) -> MutexGuard<'_, HashMap<String, Option<String>>> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lookup(&self, name: &str) -> Option<Option<String>> {
        self.values().get(&name.to_ascii_lowercase()).cloned()
    }

    fn store<'a, I>(&self, values: I)
    where
        I: IntoIterator<Item = &'a (String, Option<String>)>,
    {
        let mut cache = self.values();
        for (name, value) in values {
            cache.insert(name.to_ascii_lowercase(), value.clone());
        }
    }
}

type Notifier = Arc<watch::Sender<Option<ShutdownReason>>>;

/// Records `reason` unless an earlier one was already published.
fn publish(notifier: &watch::Sender<Option<ShutdownReason>>, reason: ShutdownReason) {
    notifier.send_if_modified(|current| {
        if current.is_none() {
            *current = Some(reason);
            true
        } else {
            false
        }
    });
}

/// A launched Tor process, watched by its monitor task.
struct ProcessHandle {
    pid: Option<u32>,
    kill: oneshot::Sender<()>,
    monitor: JoinHandle<()>,
}

impl ProcessHandle {
    fn launch(params: &ClientCreateParams, stopping: Arc<AtomicBool>, notifier: Notifier) -> Result<Self> {
        let mut command = Command::new(&params.tor_path);
        command
            .args(params.launch_arguments())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        // A relative executable path would be resolved against the new cwd.
        if let Some(dir) = params
            .tor_path
            .parent()
            .filter(|_| params.tor_path.is_absolute())
        {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(|e| {
            Error::ProcessLaunch(format!("{}: {}", params.tor_path.display(), e))
        })?;
        let pid = child.id();
        plog(
            LogLevel::Notice,
            &format!("Launched {} (pid {:?})", params.tor_path.display(), pid),
        );

        let (kill, kill_rx) = oneshot::channel();
        let monitor = tokio::spawn(monitor_process(child, kill_rx, stopping, notifier));
        Ok(Self { pid, kill, monitor })
    }

    /// Waits for a halted process to exit; kills it otherwise.
    async fn stop(self, halted: bool) {
        let Self { kill, mut monitor, pid } = self;
        if halted && tokio::time::timeout(HALT_GRACE, &mut monitor).await.is_ok() {
            return;
        }
        plog(LogLevel::Info, &format!("Killing tor (pid {:?})", pid));
        let _ = kill.send(());
        let _ = monitor.await;
    }
}

async fn monitor_process(
    mut child: Child,
    kill: oneshot::Receiver<()>,
    stopping: Arc<AtomicBool>,
    notifier: Notifier,
) {
    tokio::select! {
        status = child.wait() => {
            let code = status.ok().and_then(|s| s.code());
            if !stopping.load(Ordering::SeqCst) {
                plog(LogLevel::Warn, &format!("tor exited unexpectedly (code {:?})", code));
                publish(&notifier, ShutdownReason::UnexpectedExit(code));
            }
        }
        _ = kill => {
            if let Err(e) = child.kill().await {
                plog(LogLevel::Debug, &format!("failed to kill tor: {}", e));
            }
        }
    }
}

/// A connected Tor client.
pub struct Client {
    endpoint: ControlEndpoint,
    socks_addr: SocketAddr,
    configuration: Arc<ConfigurationCache>,
    registry: Arc<StatusRegistry>,
    _attachment: RegistryAttachment,
    _configuration_subscription: Subscription,
    session: EventSession,
    proxy: Option<ProxyListener>,
    process: Option<ProcessHandle>,
    stopping: Arc<AtomicBool>,
    notifier: Notifier,
    session_watcher: JoinHandle<()>,
}

impl Client {
    /// Launches Tor and connects to it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for bad parameters,
    /// [`Error::ProcessLaunch`] when the executable cannot be started,
    /// [`Error::UnsupportedVersion`] for a Tor older than
    /// [`MINIMUM_SUPPORTED_VERSION`], or the session's connect and
    /// authentication errors. The launched process is killed on failure.
    pub async fn create(params: ClientCreateParams, options: ClientOptions) -> Result<Self> {
        params.validate()?;

        let stopping = Arc::new(AtomicBool::new(false));
        let (notifier, _) = watch::channel(None);
        let notifier = Arc::new(notifier);
        let process = ProcessHandle::launch(&params, Arc::clone(&stopping), Arc::clone(&notifier))?;

        tokio::time::sleep(options.startup_delay).await;

        let endpoint = ControlEndpoint::local(params.control_port, params.control_password.as_str());
        let socks_addr = SocketAddr::from(([127, 0, 0, 1], params.socks_port));
        let client = Self::establish(endpoint, socks_addr, options, stopping, notifier).await;
        match client {
            Ok(mut client) => {
                client.process = Some(process);
                Ok(client)
            }
            Err(e) => {
                process.stop(false).await;
                Err(e)
            }
        }
    }

    /// Attaches to a Tor process that is already running.
    ///
    /// No startup delay is applied.
    ///
    /// # Errors
    ///
    /// As [`create`](Self::create), minus process launch failures.
    pub async fn connect(params: ClientRemoteParams, options: ClientOptions) -> Result<Self> {
        params.validate()?;

        let socks_addr = tokio::net::lookup_host((params.address.as_str(), params.socks_port))
            .await?
            .next()
            .ok_or_else(|| Error::Config(format!("cannot resolve {}", params.address)))?;
        let endpoint = ControlEndpoint::new(
            params.address.clone(),
            params.control_port,
            params.control_password.as_str(),
        );
        let (notifier, _) = watch::channel(None);
        Self::establish(
            endpoint,
            socks_addr,
            options,
            Arc::new(AtomicBool::new(false)),
            Arc::new(notifier),
        )
        .await
    }

    async fn establish(
        endpoint: ControlEndpoint,
        socks_addr: SocketAddr,
        options: ClientOptions,
        stopping: Arc<AtomicBool>,
        notifier: Notifier,
    ) -> Result<Self> {
        let configuration = Arc::new(ConfigurationCache::default());

        let ready_endpoint = endpoint.clone();
        let ready_cache = Arc::clone(&configuration);
        let tracked = options.tracked_options.clone();
        let session = EventSession::start(&endpoint, move || async move {
            if tracked.is_empty() {
                return;
            }
            let names: Vec<&str> = tracked.iter().map(String::as_str).collect();
            match commands::get_conf(&ready_endpoint, &names).await {
                Ok(values) => ready_cache.store(&values),
                Err(e) => plog(
                    LogLevel::Warn,
                    &format!(
                        "Failed to retrieve configuration values (check your control port and password): {}",
                        e
                    ),
                ),
            }
        })
        .await?;

        let version = match commands::get_version(&endpoint).await {
            Ok(version) => version,
            Err(e) => {
                plog(LogLevel::Debug, &format!("could not query the tor version: {}", e));
                TorVersion::default()
            }
        };
        if !version.is_empty() && version < MINIMUM_SUPPORTED_VERSION {
            session.shutdown();
            return Err(Error::UnsupportedVersion {
                found: version,
                minimum: MINIMUM_SUPPORTED_VERSION,
            });
        }
        plog(LogLevel::Info, &format!("Connected to tor {}", version));

        let registry = Arc::new(StatusRegistry::default());
        let attachment = status::attach(Arc::clone(&registry), &session, endpoint.clone());

        let changes = Arc::clone(&configuration);
        let configuration_subscription =
            session.subscribe(EventKind::ConfigurationChanged, move |event| {
                if let TorEvent::ConfigurationChanged(values) = event {
                    changes.store(values);
                }
            });

        let proxy = if options.proxy_enabled {
            match ProxyListener::bind(options.proxy_port, socks_addr).await {
                Ok(proxy) => Some(proxy),
                Err(e) => {
                    plog(
                        LogLevel::Warn,
                        &format!("Web proxy disabled, port {} unavailable: {}", options.proxy_port, e),
                    );
                    None
                }
            }
        } else {
            None
        };

        let session_watcher = tokio::spawn(watch_session(
            session.state(),
            Arc::clone(&stopping),
            Arc::clone(&notifier),
        ));

        Ok(Self {
            endpoint,
            socks_addr,
            configuration,
            registry,
            _attachment: attachment,
            _configuration_subscription: configuration_subscription,
            session,
            proxy,
            process: None,
            stopping,
            notifier,
            session_watcher,
        })
    }

    /// The control endpoint used for commands.
    pub fn endpoint(&self) -> &ControlEndpoint {
        &self.endpoint
    }

    /// Returns true if this client launched its own Tor.
    pub fn owns_process(&self) -> bool {
        self.process.is_some()
    }

    /// Returns a configuration value, from the cache when possible.
    ///
    /// `Ok(None)` means the option is unset or has no value.
    pub async fn get_config_value(&self, name: &str) -> Result<Option<String>> {
        if let Some(value) = self.configuration.lookup(name) {
            return Ok(value);
        }
        let values = commands::get_conf(&self.endpoint, &[name]).await?;
        self.configuration.store(&values);
        Ok(values
            .into_iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .and_then(|(_, value)| value))
    }

    /// Sets a configuration value through SETCONF and caches it.
    pub async fn set_config_value(&self, name: &str, value: &str) -> Result<()> {
        commands::set_conf(&self.endpoint, name, value).await?;
        let stored = (!value.is_empty()).then(|| value.to_string());
        self.configuration.store(&[(name.to_string(), stored)]);
        Ok(())
    }

    /// Writes Tor's configuration back to its torrc.
    pub async fn save_configuration(&self) -> Result<()> {
        commands::save_conf(&self.endpoint).await
    }

    /// Switches to clean circuits for new connections.
    pub async fn new_identity(&self) -> Result<()> {
        commands::signal_newnym(&self.endpoint).await
    }

    /// Drops Tor's cached DNS answers.
    pub async fn clear_dns_cache(&self) -> Result<()> {
        commands::signal_clear_dns_cache(&self.endpoint).await
    }

    /// Opens a TCP stream to `host:port` through Tor's SOCKS port.
    pub async fn open_stream(&self, host: &str, port: u16) -> Result<TcpStream> {
        let target = SocksTarget::from_host(host, port)?;
        socks::connect(self.socks_addr, &target).await
    }

    /// Live circuit, stream and OR-connection records.
    pub fn status(&self) -> Arc<StatusRegistry> {
        Arc::clone(&self.registry)
    }

    /// The event session, for custom subscriptions.
    pub fn events(&self) -> &EventSession {
        &self.session
    }

    /// The HTTP proxy, if it is enabled and bound.
    pub fn web_proxy(&self) -> Option<&ProxyListener> {
        self.proxy.as_ref()
    }

    /// Watches for the reason the client stopped.
    ///
    /// The value stays `None` while the client runs and is set exactly once.
    pub fn shutdown_notifications(&self) -> watch::Receiver<Option<ShutdownReason>> {
        self.notifier.subscribe()
    }

    /// Stops the launched Tor, the proxy and the event session.
    ///
    /// A launched Tor is asked to halt and killed if it does not exit in
    /// time. An attached Tor keeps running.
    pub async fn shutdown(&mut self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(process) = self.process.take() {
            let halted = commands::signal_halt(&self.endpoint).await.is_ok();
            process.stop(halted).await;
        }
        if let Some(proxy) = self.proxy.take() {
            proxy.shutdown();
        }
        self.session.shutdown();
        self.session_watcher.abort();
        publish(&self.notifier, ShutdownReason::Requested);
        plog(LogLevel::Notice, "Client shut down");
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.session_watcher.abort();
        // The monitor kills the process once its kill sender is dropped.
    }
}

async fn watch_session(
    mut state: watch::Receiver<SessionState>,
    stopping: Arc<AtomicBool>,
    notifier: Notifier,
) {
    let _ = state.wait_for(|s| *s == SessionState::Disconnected).await;
    if !stopping.load(Ordering::SeqCst) {
        plog(LogLevel::Warn, "Lost the event session with tor");
        publish(&notifier, ShutdownReason::SessionLost);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    /// Fake Tor control port accepting any number of connections.
    ///
    /// Answers GETCONF with a fixed pair, `GETINFO version` with `version`,
    /// and a SETEVENTS naming CONF_CHANGED with one change event. With
    /// `drop_session`, the first SETEVENTS closes its connection instead.
    async fn fake_tor(version: &'static str, drop_session: bool) -> (u16, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let received = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&received);
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let log = Arc::clone(&log);
                tokio::spawn(async move {
                    let mut reader = BufReader::new(socket);
                    loop {
                        let mut line = String::new();
                        if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                            break;
                        }
                        let line = line.trim_end().to_string();
                        log.lock().unwrap().push(line.clone());
                        let reply = if line.starts_with("GETCONF") {
                            "250-SocksPort=9050\r\n250 ExitNodes\r\n".to_string()
                        } else if line == "GETINFO version" {
                            format!("250-version={}\r\n250 OK\r\n", version)
                        } else if line.starts_with("SETEVENTS") {
                            if drop_session {
                                break;
                            }
                            if line.contains("CONF_CHANGED") {
                                "250 OK\r\n650-CONF_CHANGED\r\n650-ExitNodes={de}\r\n650 OK\r\n"
                                    .to_string()
                            } else {
                                "250 OK\r\n".to_string()
                            }
                        } else {
                            "250 OK\r\n".to_string()
                        };
                        if reader.get_mut().write_all(reply.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        (port, received)
    }

    fn options() -> ClientOptions {
        ClientOptions {
            proxy_enabled: false,
            ..ClientOptions::default()
        }
    }

    fn remote(port: u16) -> ClientRemoteParams {
        ClientRemoteParams::new("127.0.0.1", port, "secret")
    }

    #[test]
    fn test_secure_password_debug_redacted() {
        let password = SecurePassword::new("secret123".to_string());
        let debug_str = format!("{:?}", password);
        assert!(!debug_str.contains("secret123"));
        assert!(debug_str.contains("REDACTED"));
        assert_eq!(password.as_str(), "secret123");
    }

    #[test]
    fn test_launch_arguments() {
        let mut params = ClientCreateParams::new("/opt/tor/tor");
        params.control_port = 9151;
        params.socks_port = 9150;
        params.torrc = Some(PathBuf::from("/etc/tor/my torrc"));
        params.defaults_torrc = Some(PathBuf::from("  "));
        params.overrides.push(("ExitNodes".to_string(), "{us},{ca}".to_string()));

        assert_eq!(
            params.launch_arguments(),
            vec![
                "--ignore-missing-torrc",
                "--allow-missing-torrc",
                "--ControlPort",
                "9151",
                "--SocksPort",
                "9150",
                "-f",
                "/etc/tor/my torrc",
                "--ExitNodes",
                "{us},{ca}",
            ]
        );
    }

    #[test]
    fn test_parameter_validation() {
        assert!(ClientCreateParams::new("").validate().is_err());
        let mut params = ClientCreateParams::new("tor");
        params.socks_port = params.control_port;
        assert!(params.validate().is_err());
        assert!(ClientRemoteParams::new(" ", 9051, "").validate().is_err());
        assert!(ClientRemoteParams::new("localhost", 0, "").validate().is_err());
        assert!(ClientRemoteParams::new("localhost", 9051, "").validate().is_ok());
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let params = ClientCreateParams::new("/nonexistent/torctl-test/tor");
        let err = Client::create(params, options()).await.err().unwrap();
        assert!(matches!(err, Error::ProcessLaunch(_)));
    }

    #[tokio::test]
    async fn test_configuration_channel() {
        let (port, received) = fake_tor("0.4.8.10", false).await;
        let mut client = Client::connect(remote(port), options()).await.unwrap();
        assert!(!client.owns_process());
        assert!(client.web_proxy().is_none());

        assert_eq!(
            client.get_config_value("socksport").await.unwrap(),
            Some("9050".to_string())
        );

        client.set_config_value("MaxCircuitDirtiness", "600").await.unwrap();
        assert_eq!(
            client.get_config_value("MaxCircuitDirtiness").await.unwrap(),
            Some("600".to_string())
        );

        // CONF_CHANGED from the session replaces the cached empty value.
        let updated = async {
            loop {
                if client.get_config_value("ExitNodes").await.unwrap().is_some() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), updated).await.unwrap();
        assert_eq!(
            client.get_config_value("ExitNodes").await.unwrap(),
            Some("{de}".to_string())
        );

        client.get_config_value("DataDirectory").await.unwrap();
        client.new_identity().await.unwrap();

        let mut notifications = client.shutdown_notifications();
        client.shutdown().await;
        assert_eq!(*notifications.borrow_and_update(), Some(ShutdownReason::Requested));
        assert!(!client.events().is_streaming());

        let lines = received.lock().unwrap().clone();
        assert!(lines.iter().any(|l| l.starts_with("GETCONF SocksPort ControlPort ExitNodes")));
        assert!(lines.contains(&"SETCONF MaxCircuitDirtiness=600".to_string()));
        assert!(lines.contains(&"GETCONF DataDirectory".to_string()));
        assert!(lines.contains(&"SIGNAL NEWNYM".to_string()));
        assert!(!lines.contains(&"SIGNAL HALT".to_string()));
    }

    #[tokio::test]
    async fn test_unsupported_version() {
        let (port, _) = fake_tor("0.2.0.8", false).await;
        let err = Client::connect(remote(port), options()).await.err().unwrap();
        match err {
            Error::UnsupportedVersion { found, minimum } => {
                assert_eq!(found, TorVersion::new(0, 2, 0, 8));
                assert_eq!(minimum, MINIMUM_SUPPORTED_VERSION);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_version_is_accepted() {
        let (port, _) = fake_tor("unknown", false).await;
        assert!(Client::connect(remote(port), options()).await.is_ok());
    }

    #[tokio::test]
    async fn test_session_lost_notification() {
        let (port, _) = fake_tor("0.4.8.10", true).await;
        let client = Client::connect(remote(port), options()).await.unwrap();
        let mut notifications = client.shutdown_notifications();
        let reason = *tokio::time::timeout(
            Duration::from_secs(5),
            notifications.wait_for(|reason| reason.is_some()),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(reason, Some(ShutdownReason::SessionLost));
    }

    #[tokio::test]
    async fn test_proxy_started_with_client() {
        let (port, _) = fake_tor("0.4.8.10", false).await;
        let options = ClientOptions {
            proxy_port: 0,
            ..ClientOptions::default()
        };
        let mut client = Client::connect(remote(port), options).await.unwrap();
        let proxy = client.web_proxy().unwrap();
        assert!(proxy.is_running());
        assert!(proxy.address().starts_with("http://127.0.0.1:"));
        client.shutdown().await;
        assert!(client.web_proxy().is_none());
    }

    #[tokio::test]
    async fn test_proxy_port_in_use_keeps_client() {
        let (port, received) = fake_tor("0.4.8.10", false).await;
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let options = ClientOptions {
            proxy_port: occupied.local_addr().unwrap().port(),
            ..ClientOptions::default()
        };
        let mut client = Client::connect(remote(port), options).await.unwrap();
        assert!(client.web_proxy().is_none());
        assert!(client.events().is_streaming());

        assert_eq!(
            client.get_config_value("SocksPort").await.unwrap(),
            Some("9050".to_string())
        );
        client.new_identity().await.unwrap();
        assert!(received.lock().unwrap().contains(&"SIGNAL NEWNYM".to_string()));

        client.shutdown().await;
        drop(occupied);
    }
}
