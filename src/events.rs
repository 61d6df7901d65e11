//! The long-lived event session.
//!
//! An [`EventSession`] holds one TCP connection to the control port for its
//! whole lifetime. It authenticates, lets the owner run a ready step and then
//! streams asynchronous `650` notifications to subscribers. Nothing is sent
//! after authentication until the first subscriber arrives.
//!
//! # Session States
//!
//! ```text
//!   Connecting ──► Authenticating ──► Subscribing ──► Streaming
//!        │               │                 │              │
//!        └───────────────┴─────────────────┴──────────────┴──► Disconnected
//! ```
//!
//! Any socket error moves the session to `Disconnected`. The session does not
//! reconnect.
//!
//! # Tasks
//!
//! ```text
//!   socket ──► reader task ──► Reassembler ──► dispatcher ──► mpsc ──► delivery task ──► callbacks
//!
//!   subscribe()/drop(Subscription) ──► SETEVENTS line ──► mpsc ──► writer task ──► socket
//! ```
//!
//! Subscriptions are reference counted per [`EventKind`]. The first
//! subscriber of a kind and the last one leaving it both re-issue `SETEVENTS`
//! with the full set of subscribed kinds, while the subscription lock is held.
//!
//! # Reassembly
//!
//! Bytes are buffered until a CRLF arrives, so a line split across reads is
//! never dispatched in pieces. `250` lines on this socket are command
//! acknowledgements and are dropped. A `650-` line opens a block when its kind
//! is multi-line (`CONF_CHANGED`) and is otherwise complete on its own. Once
//! a block is open every following dash line joins it, and the next final
//! line (`650 OK`) closes it. `650+` data blocks run until a lone `.`.

use std::collections::HashMap;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};

use crate::bytes::Bytes;
use crate::circuit::Circuit;
use crate::codec::{parse_key_value, ReplyLine, Separator};
use crate::config::LogLevel;
use crate::connection::{ControlConnection, ControlEndpoint};
use crate::error::Result;
use crate::logger::plog;
use crate::orconn::OrConnection;
use crate::stream::Stream;
use crate::wire::{wire_enum, WireToken};

wire_enum! {
    /// Asynchronous event types this crate understands.
    pub enum EventKind {
        /// Event name not recognised.
        Unknown,
        /// Circuit status changed.
        Circuit => "CIRC",
        /// Stream status changed.
        Stream => "STREAM",
        /// OR connection status changed.
        OrConnection => "ORCONN",
        /// Bytes read and written in the last second.
        Bandwidth => "BW",
        /// Configuration values changed.
        ConfigurationChanged => "CONF_CHANGED",
        /// Debug-level Tor log message.
        Debug => "DEBUG",
        /// Info-level Tor log message.
        Info => "INFO",
        /// Notice-level Tor log message.
        Notice => "NOTICE",
        /// Warning-level Tor log message.
        Warn => "WARN",
        /// Error-level Tor log message.
        Error => "ERR",
    }
}

impl EventKind {
    /// Returns true for kinds whose notifications span several lines.
    pub fn is_multi_line(self) -> bool {
        matches!(self, EventKind::ConfigurationChanged)
    }

    /// Severity carried by a log kind; `None` for every other kind.
    pub fn severity(self) -> Option<LogLevel> {
        match self {
            EventKind::Debug => Some(LogLevel::Debug),
            EventKind::Info => Some(LogLevel::Info),
            EventKind::Notice => Some(LogLevel::Notice),
            EventKind::Warn => Some(LogLevel::Warn),
            EventKind::Error => Some(LogLevel::Error),
            _ => None,
        }
    }

    fn for_severity(severity: LogLevel) -> Self {
        match severity {
            LogLevel::Debug => EventKind::Debug,
            LogLevel::Info => EventKind::Info,
            LogLevel::Notice => EventKind::Notice,
            LogLevel::Warn => EventKind::Warn,
            LogLevel::Error => EventKind::Error,
        }
    }
}

/// A parsed asynchronous notification.
#[derive(Debug, Clone, PartialEq)]
pub enum TorEvent {
    /// Bytes read and written during the last second.
    Bandwidth {
        /// Bytes read.
        downloaded: Bytes,
        /// Bytes written.
        uploaded: Bytes,
    },
    /// A circuit changed status.
    Circuit(Circuit),
    /// A stream changed status.
    Stream(Stream),
    /// An OR connection changed status.
    OrConnection(OrConnection),
    /// Configuration values changed; `None` means the option was reset.
    ConfigurationChanged(Vec<(String, Option<String>)>),
    /// A Tor log message.
    Log {
        /// Severity Tor assigned.
        severity: LogLevel,
        /// Message text.
        message: String,
    },
}

impl TorEvent {
    /// The kind a subscriber must register for to receive this event.
    pub fn kind(&self) -> EventKind {
        match self {
            TorEvent::Bandwidth { .. } => EventKind::Bandwidth,
            TorEvent::Circuit(_) => EventKind::Circuit,
            TorEvent::Stream(_) => EventKind::Stream,
            TorEvent::OrConnection(_) => EventKind::OrConnection,
            TorEvent::ConfigurationChanged(_) => EventKind::ConfigurationChanged,
            TorEvent::Log { severity, .. } => EventKind::for_severity(*severity),
        }
    }
}

/// Turns the body of one event into typed events.
pub trait EventDispatcher: Send {
    /// Parses `body`; unparsable bodies yield nothing.
    fn dispatch(&self, body: &str) -> Vec<TorEvent>;
}

struct BandwidthDispatcher;

impl EventDispatcher for BandwidthDispatcher {
    fn dispatch(&self, body: &str) -> Vec<TorEvent> {
        let mut fields = body.split_whitespace().map(str::parse::<f64>);
        match (fields.next(), fields.next()) {
            (Some(Ok(read)), Some(Ok(written))) => vec![TorEvent::Bandwidth {
                downloaded: Bytes::from_bytes(read).normalize(),
                uploaded: Bytes::from_bytes(written).normalize(),
            }],
            _ => Vec::new(),
        }
    }
}

struct CircuitDispatcher;

impl EventDispatcher for CircuitDispatcher {
    fn dispatch(&self, body: &str) -> Vec<TorEvent> {
        Circuit::parse(body).map(TorEvent::Circuit).into_iter().collect()
    }
}

struct StreamDispatcher;

impl EventDispatcher for StreamDispatcher {
    fn dispatch(&self, body: &str) -> Vec<TorEvent> {
        Stream::parse(body).map(TorEvent::Stream).into_iter().collect()
    }
}

struct OrConnectionDispatcher;

impl EventDispatcher for OrConnectionDispatcher {
    fn dispatch(&self, body: &str) -> Vec<TorEvent> {
        OrConnection::parse(body)
            .map(TorEvent::OrConnection)
            .into_iter()
            .collect()
    }
}

struct ConfigurationChangedDispatcher;

impl EventDispatcher for ConfigurationChangedDispatcher {
    fn dispatch(&self, body: &str) -> Vec<TorEvent> {
        let values: Vec<_> = body
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && *line != "." && !line.eq_ignore_ascii_case("OK"))
            .map(parse_key_value)
            .collect();
        if values.is_empty() {
            Vec::new()
        } else {
            vec![TorEvent::ConfigurationChanged(values)]
        }
    }
}

struct LogDispatcher(LogLevel);

impl EventDispatcher for LogDispatcher {
    fn dispatch(&self, body: &str) -> Vec<TorEvent> {
        body.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && *line != "." && !line.starts_with("250"))
            .map(|message| TorEvent::Log {
                severity: self.0,
                message: message.to_string(),
            })
            .collect()
    }
}

type DispatcherFactory = fn() -> Box<dyn EventDispatcher>;

fn dispatchers() -> &'static HashMap<EventKind, DispatcherFactory> {
    static DISPATCHERS: OnceLock<HashMap<EventKind, DispatcherFactory>> = OnceLock::new();
    DISPATCHERS.get_or_init(|| {
        let mut map: HashMap<EventKind, DispatcherFactory> = HashMap::new();
        map.insert(EventKind::Bandwidth, || Box::new(BandwidthDispatcher));
        map.insert(EventKind::Circuit, || Box::new(CircuitDispatcher));
        map.insert(EventKind::Stream, || Box::new(StreamDispatcher));
        map.insert(EventKind::OrConnection, || Box::new(OrConnectionDispatcher));
        map.insert(EventKind::ConfigurationChanged, || {
            Box::new(ConfigurationChangedDispatcher)
        });
        map.insert(EventKind::Debug, || Box::new(LogDispatcher(LogLevel::Debug)));
        map.insert(EventKind::Info, || Box::new(LogDispatcher(LogLevel::Info)));
        map.insert(EventKind::Notice, || Box::new(LogDispatcher(LogLevel::Notice)));
        map.insert(EventKind::Warn, || Box::new(LogDispatcher(LogLevel::Warn)));
        map.insert(EventKind::Error, || Box::new(LogDispatcher(LogLevel::Error)));
        map
    })
}

/// Splits a reassembled unit into its event name and body.
///
/// A single line yields the text after the name; a multi-line unit yields
/// everything after the first CRLF.
fn split_unit(unit: &str) -> (&str, &str) {
    let (first, rest) = unit.split_once("\r\n").unwrap_or((unit, ""));
    let (name, inline) = first.split_once(' ').unwrap_or((first, ""));
    let body = if rest.is_empty() { inline } else { rest };
    (name, body.trim())
}

/// Parses one reassembled event unit (`NAME body`, without the `650`
/// prefix). Unknown event names yield nothing.
pub fn parse_event(unit: &str) -> Vec<TorEvent> {
    let (name, body) = split_unit(unit);
    let kind = EventKind::from_token(name);
    match dispatchers().get(&kind) {
        Some(factory) => factory().dispatch(body),
        None => Vec::new(),
    }
}

/// Longest unterminated line kept while waiting for its CRLF.
pub(crate) const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Rebuilds complete event units from arbitrarily split socket reads.
#[derive(Debug, Default)]
pub(crate) struct Reassembler {
    backlog: Vec<u8>,
    scanned: usize,
    pending: Option<String>,
    in_data: bool,
    data_opened_unit: bool,
}

impl Reassembler {
    /// Appends `bytes` and returns every unit they complete.
    pub(crate) fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.backlog.extend_from_slice(bytes);

        let mut units = Vec::new();
        let mut start = 0;
        let mut search_from = self.scanned;
        while let Some(offset) = find_crlf(&self.backlog[search_from..]) {
            let end = search_from + offset;
            let line = String::from_utf8_lossy(&self.backlog[start..end]).into_owned();
            self.push_line(&line, &mut units);
            start = end + 2;
            search_from = start;
        }
        self.backlog.drain(..start);

        if self.backlog.len() > MAX_LINE_BYTES {
            plog(
                LogLevel::Warn,
                &format!(
                    "discarding {} bytes of an event line without CRLF",
                    self.backlog.len()
                ),
            );
            self.backlog.clear();
        }
        // A trailing '\r' may still pair with the next read's '\n'.
        self.scanned = self.backlog.len().saturating_sub(1);

        units
    }

    fn push_line(&mut self, line: &str, units: &mut Vec<String>) {
        if self.in_data {
            if line == "." {
                self.in_data = false;
                if self.data_opened_unit {
                    units.extend(self.pending.take());
                }
            } else {
                let line = line.strip_prefix('.').filter(|l| l.starts_with('.')).unwrap_or(line);
                append_line(&mut self.pending, line);
            }
            return;
        }

        let Some(reply) = ReplyLine::parse(line) else {
            plog(LogLevel::Debug, &format!("ignoring malformed event line: {:?}", line));
            return;
        };
        if reply.code == 250 {
            return;
        }

        match reply.separator {
            Separator::Data => {
                self.data_opened_unit = self.pending.is_none();
                append_line(&mut self.pending, reply.text);
                self.in_data = true;
            }
            Separator::Continuation => {
                let name = reply.text.split(' ').next().unwrap_or("");
                if self.pending.is_some() || EventKind::from_token(name).is_multi_line() {
                    append_line(&mut self.pending, reply.text);
                } else {
                    units.push(reply.text.to_string());
                }
            }
            Separator::End => match self.pending.take() {
                Some(unit) => units.push(unit),
                None => units.push(reply.text.to_string()),
            },
        }
    }
}

fn append_line(pending: &mut Option<String>, line: &str) {
    match pending {
        Some(unit) => {
            unit.push_str("\r\n");
            unit.push_str(line);
        }
        None => *pending = Some(line.to_string()),
    }
}

fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|pair| pair == b"\r\n")
}

/// Connection state of an [`EventSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No connection.
    Disconnected,
    /// Opening the TCP connection.
    Connecting,
    /// Waiting for the AUTHENTICATE reply.
    Authenticating,
    /// Starting the reader and writer tasks.
    Subscribing,
    /// Receiving events.
    Streaming,
}

type Callback = Arc<dyn Fn(&TorEvent) + Send + Sync>;

#[derive(Default)]
struct SubscriptionTable {
    next_id: u64,
    callbacks: HashMap<EventKind, Vec<(u64, Callback)>>,
}

impl SubscriptionTable {
    fn setevents_line(&self) -> String {
        let mut line = String::from("SETEVENTS");
        for (kind, token) in EventKind::TABLE {
            if self.callbacks.get(kind).is_some_and(|c| !c.is_empty()) {
                line.push(' ');
                line.push_str(token);
            }
        }
        line
    }
}

struct Shared {
    subscriptions: Mutex<SubscriptionTable>,
    state: watch::Sender<SessionState>,
    commands: mpsc::UnboundedSender<String>,
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, SubscriptionTable> {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn callbacks_for(&self, kind: EventKind) -> Vec<Callback> {
        self.table()
            .callbacks
            .get(&kind)
            .map(|entries| entries.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default()
    }

    fn unsubscribe(&self, kind: EventKind, id: u64) {
        let mut table = self.table();
        let Some(entries) = table.callbacks.get_mut(&kind) else {
            return;
        };
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        if before > 0 && entries.is_empty() {
            table.callbacks.remove(&kind);
            let _ = self.commands.send(table.setevents_line());
        }
    }
}

/// Handle returned by [`EventSession::subscribe`].
///
/// Dropping the handle (or calling [`cancel`](Subscription::cancel))
/// removes the callback.
pub struct Subscription {
    shared: Weak<Shared>,
    kind: EventKind,
    id: u64,
}

impl Subscription {
    /// The event kind this subscription receives.
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Removes the callback now.
    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.unsubscribe(self.kind, self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .finish()
    }
}

/// A persistent connection receiving asynchronous events.
pub struct EventSession {
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
}

impl EventSession {
    /// Connects, authenticates, runs `on_ready` once and starts streaming.
    ///
    /// `on_ready` runs after authentication succeeds and before the reader
    /// task starts.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connect`](crate::Error::Connect) or
    /// [`Error::Authentication`](crate::Error::Authentication) when the
    /// session cannot be established.
    pub async fn start<F, Fut>(endpoint: &ControlEndpoint, on_ready: F) -> Result<Self>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        let (state, _) = watch::channel(SessionState::Connecting);

        let mut connection = ControlConnection::connect(endpoint).await?;
        state.send_replace(SessionState::Authenticating);
        connection.authenticate(endpoint.password.as_str()).await?;

        on_ready().await;

        state.send_replace(SessionState::Subscribing);

        let (buffered, socket) = connection.into_parts();
        let (read_half, write_half) = socket.into_split();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            subscriptions: Mutex::new(SubscriptionTable::default()),
            state,
            commands: commands_tx,
        });

        let writer = tokio::spawn(write_commands(write_half, commands_rx));
        let mut reassembler = Reassembler::default();
        for unit in reassembler.feed(&buffered) {
            for event in parse_event(&unit) {
                let _ = events_tx.send(event);
            }
        }
        let reader = tokio::spawn(read_events(
            read_half,
            reassembler,
            events_tx,
            Arc::clone(&shared),
            writer.abort_handle(),
        ));
        let delivery = tokio::spawn(deliver_events(events_rx, Arc::downgrade(&shared)));

        shared.state.send_replace(SessionState::Streaming);
        plog(
            LogLevel::Notice,
            &format!("Event session established with {}", endpoint.address()),
        );

        Ok(Self {
            shared,
            tasks: vec![reader, writer, delivery],
        })
    }

    /// Registers `callback` for every event of `kind`.
    ///
    /// The first subscriber of a kind re-issues `SETEVENTS`.
    pub fn subscribe<F>(&self, kind: EventKind, callback: F) -> Subscription
    where
        F: Fn(&TorEvent) + Send + Sync + 'static,
    {
        let mut table = self.shared.table();
        table.next_id += 1;
        let id = table.next_id;

        let callback: Callback = Arc::new(callback);
        let entries = table.callbacks.entry(kind).or_default();
        entries.push((id, callback));
        if entries.len() == 1 {
            let _ = self.shared.commands.send(table.setevents_line());
        }

        Subscription {
            shared: Arc::downgrade(&self.shared),
            kind,
            id,
        }
    }

    /// Number of live subscriptions for `kind`.
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.shared
            .table()
            .callbacks
            .get(&kind)
            .map_or(0, Vec::len)
    }

    /// Watches the session state.
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Returns true while events are being received.
    pub fn is_streaming(&self) -> bool {
        *self.shared.state.borrow() == SessionState::Streaming
    }

    /// Resolves once the session is disconnected.
    pub async fn closed(&self) {
        let mut state = self.state();
        let _ = state.wait_for(|s| *s == SessionState::Disconnected).await;
    }

    /// Closes the socket and stops every session task.
    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
        self.shared.state.send_replace(SessionState::Disconnected);
    }
}

impl Drop for EventSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn write_commands(mut socket: OwnedWriteHalf, mut commands: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = commands.recv().await {
        let frame = format!("{}\r\n", line);
        if let Err(e) = socket.write_all(frame.as_bytes()).await {
            plog(LogLevel::Debug, &format!("event session write failed: {}", e));
            break;
        }
    }
}

async fn read_events(
    mut socket: OwnedReadHalf,
    mut reassembler: Reassembler,
    events: mpsc::UnboundedSender<TorEvent>,
    shared: Arc<Shared>,
    writer: AbortHandle,
) {
    let mut buffer = vec![0u8; 8192];
    loop {
        match socket.read(&mut buffer).await {
            Ok(0) => {
                plog(LogLevel::Info, "Tor closed the event session");
                break;
            }
            Ok(read) => {
                for unit in reassembler.feed(&buffer[..read]) {
                    for event in parse_event(&unit) {
                        let _ = events.send(event);
                    }
                }
            }
            Err(e) => {
                plog(LogLevel::Info, &format!("event session read failed: {}", e));
                break;
            }
        }
    }

    writer.abort();
    shared.state.send_replace(SessionState::Disconnected);
}

async fn deliver_events(mut events: mpsc::UnboundedReceiver<TorEvent>, shared: Weak<Shared>) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        for callback in shared.callbacks_for(event.kind()) {
            if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                plog(
                    LogLevel::Warn,
                    &format!("{} subscriber panicked; event dropped", event.kind()),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{CircuitBuildFlags, CircuitPurpose, CircuitStatus};
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    fn units(chunks: &[&str]) -> Vec<String> {
        let mut reassembler = Reassembler::default();
        chunks
            .iter()
            .flat_map(|chunk| reassembler.feed(chunk.as_bytes()))
            .collect()
    }

    #[test]
    fn test_line_split_across_reads() {
        let out = units(&["650-CIRC 12 BUI", "LT\r\n"]);
        assert_eq!(out, vec!["CIRC 12 BUILT"]);
        let events = parse_event(&out[0]);
        assert_eq!(events.len(), 1);
        match &events[0] {
            TorEvent::Circuit(c) => {
                assert_eq!(c.id, 12);
                assert_eq!(c.status, CircuitStatus::Built);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_partial_line_is_held() {
        let mut reassembler = Reassembler::default();
        assert!(reassembler.feed(b"650 BW 10 2").is_empty());
        assert!(reassembler.feed(b"0\r").is_empty());
        assert_eq!(reassembler.feed(b"\n"), vec!["BW 10 20"]);
    }

    #[test]
    fn test_scan_resumes_across_many_reads() {
        let mut reassembler = Reassembler::default();
        for byte in b"650 NOTICE one\r" {
            assert!(reassembler.feed(&[*byte]).is_empty());
        }
        assert_eq!(reassembler.scanned, reassembler.backlog.len() - 1);
        assert_eq!(reassembler.feed(b"\n650 NOTICE two\r\n"), vec!["NOTICE one", "NOTICE two"]);
        assert!(reassembler.backlog.is_empty());
        assert_eq!(reassembler.scanned, 0);
    }

    #[test]
    fn test_oversized_line_is_discarded() {
        let mut reassembler = Reassembler::default();
        assert!(reassembler.feed(&vec![b'a'; MAX_LINE_BYTES + 1]).is_empty());
        assert!(reassembler.backlog.is_empty());
        assert_eq!(reassembler.feed(b"\r\n650 BW 1 2\r\n"), vec!["BW 1 2"]);
    }

    #[test]
    fn test_acknowledgements_dropped() {
        let out = units(&["250 OK\r\n650 STREAM 1 NEW 0 a:80\r\n250 OK\r\n"]);
        assert_eq!(out, vec!["STREAM 1 NEW 0 a:80"]);
    }

    #[test]
    fn test_conf_changed_block() {
        let out = units(&[
            "650-CONF_CHANGED\r\n650-SocksPort=9150\r\n",
            "650-ExitNodes\r\n650 OK\r\n",
        ]);
        assert_eq!(out, vec!["CONF_CHANGED\r\nSocksPort=9150\r\nExitNodes"]);
        assert_eq!(
            parse_event(&out[0]),
            vec![TorEvent::ConfigurationChanged(vec![
                ("SocksPort".to_string(), Some("9150".to_string())),
                ("ExitNodes".to_string(), None),
            ])]
        );
    }

    #[test]
    fn test_data_block() {
        let out = units(&["650+WARN\r\nfirst line\r\n..dotted\r\n.\r\n650 OK\r\n"]);
        assert_eq!(out[0], "WARN\r\nfirst line\r\n.dotted");
        assert_eq!(
            parse_event(&out[0]),
            vec![
                TorEvent::Log {
                    severity: LogLevel::Warn,
                    message: "first line".to_string()
                },
                TorEvent::Log {
                    severity: LogLevel::Warn,
                    message: ".dotted".to_string()
                },
            ]
        );
        // The trailing "650 OK" stands alone and names no known event.
        assert_eq!(out[1], "OK");
        assert!(parse_event(&out[1]).is_empty());
    }

    #[test]
    fn test_dispatch_kinds() {
        let bw = parse_event("BW 1536 2048");
        assert_eq!(
            bw,
            vec![TorEvent::Bandwidth {
                downloaded: Bytes::new(1.5, crate::bytes::ByteUnit::KB),
                uploaded: Bytes::new(2.0, crate::bytes::ByteUnit::KB),
            }]
        );
        assert!(parse_event("BW nope").is_empty());

        let circ = parse_event("CIRC 12 BUILT $FP1~nickA,$FP2~nickB BUILD_FLAGS=NEED_CAPACITY PURPOSE=GENERAL");
        let TorEvent::Circuit(c) = &circ[0] else {
            panic!("expected a circuit");
        };
        assert_eq!(c.purpose, CircuitPurpose::General);
        assert!(c.build_flags.contains(CircuitBuildFlags::NEED_CAPACITY));
        assert_eq!(c.paths, vec!["$FP1~nickA", "$FP2~nickB"]);

        assert_eq!(parse_event("ORCONN $AB~x CONNECTED ID=3")[0].kind(), EventKind::OrConnection);
        assert_eq!(parse_event("NOTICE Bootstrapped 100%")[0].kind(), EventKind::Notice);
        assert_eq!(EventKind::Error.severity(), Some(LogLevel::Error));
        assert_eq!(EventKind::Bandwidth.severity(), None);
        assert!(parse_event("ADDRMAP a b").is_empty());
    }

    #[test]
    fn test_setevents_line() {
        let mut table = SubscriptionTable::default();
        assert_eq!(table.setevents_line(), "SETEVENTS");
        let noop: Callback = Arc::new(|_: &TorEvent| {});
        table.callbacks.insert(EventKind::Bandwidth, vec![(1, Arc::clone(&noop))]);
        table.callbacks.insert(EventKind::Circuit, vec![(2, noop)]);
        assert_eq!(table.setevents_line(), "SETEVENTS CIRC BW");
    }

    async fn read_command(reader: &mut BufReader<tokio::net::TcpStream>) -> String {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        line.trim_end().to_string()
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<String>();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(socket);
            assert_eq!(read_command(&mut reader).await, "AUTHENTICATE \"pw\"");
            reader.get_mut().write_all(b"250 OK\r\n").await.unwrap();

            let subscribe = read_command(&mut reader).await;
            seen_tx.send(subscribe).unwrap();
            reader.get_mut().write_all(b"250 OK\r\n650-CIRC 12 BUI").await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            reader.get_mut().write_all(b"LT\r\n").await.unwrap();

            let unsubscribe = read_command(&mut reader).await;
            seen_tx.send(unsubscribe).unwrap();
        });

        let endpoint = ControlEndpoint::local(port, "pw");
        let ready = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&ready);
        let session = EventSession::start(&endpoint, || async move {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
        })
        .await
        .unwrap();
        assert!(ready.load(std::sync::atomic::Ordering::SeqCst));
        assert!(session.is_streaming());

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let subscription = session.subscribe(EventKind::Circuit, move |event| {
            let _ = event_tx.send(event.clone());
        });
        assert_eq!(session.subscriber_count(EventKind::Circuit), 1);
        assert_eq!(seen_rx.recv().await.unwrap(), "SETEVENTS CIRC");

        let event = tokio::time::timeout(Duration::from_secs(5), event_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let TorEvent::Circuit(circuit) = event else {
            panic!("expected a circuit event");
        };
        assert_eq!(circuit.id, 12);
        assert_eq!(circuit.status, CircuitStatus::Built);

        subscription.cancel();
        assert_eq!(session.subscriber_count(EventKind::Circuit), 0);
        assert_eq!(seen_rx.recv().await.unwrap(), "SETEVENTS");

        server.await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), session.closed())
            .await
            .unwrap();
        assert!(!session.is_streaming());
    }

    #[tokio::test]
    async fn test_second_subscriber_does_not_resubscribe() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(socket);
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                    break;
                }
                let line = line.trim_end().to_string();
                if line.starts_with("AUTHENTICATE") {
                    reader.get_mut().write_all(b"250 OK\r\n").await.unwrap();
                } else {
                    let _ = seen_tx.send(line);
                }
            }
        });

        let session = EventSession::start(&ControlEndpoint::local(port, ""), || async {})
            .await
            .unwrap();

        let first = session.subscribe(EventKind::Bandwidth, |_| {});
        let second = session.subscribe(EventKind::Bandwidth, |_| {});
        assert_eq!(seen_rx.recv().await.unwrap(), "SETEVENTS BW");
        assert_eq!(session.subscriber_count(EventKind::Bandwidth), 2);

        drop(first);
        let _notice = session.subscribe(EventKind::Notice, |_| {});
        assert_eq!(seen_rx.recv().await.unwrap(), "SETEVENTS BW NOTICE");
        drop(second);
        assert_eq!(seen_rx.recv().await.unwrap(), "SETEVENTS NOTICE");

        session.shutdown();
        assert!(!session.is_streaming());
    }

    #[tokio::test]
    async fn test_start_fails_on_bad_password() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(socket);
            let _ = read_command(&mut reader).await;
            let _ = reader
                .get_mut()
                .write_all(b"515 Authentication failed\r\n")
                .await;
        });
        let result = EventSession::start(&ControlEndpoint::local(port, "x"), || async {}).await;
        assert!(matches!(result, Err(crate::Error::Authentication(_))));
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn reassembly_ignores_read_boundaries(split in 0usize..60) {
            let wire = "650 BW 100 200\r\n650-CIRC 7 LAUNCHED\r\n650 STREAM 3 NEW 0 host:80\r\n";
            let split = split.min(wire.len());
            let mut whole = Reassembler::default();
            let mut pieces = Reassembler::default();
            let expected = whole.feed(wire.as_bytes());
            let mut got = pieces.feed(&wire.as_bytes()[..split]);
            got.extend(pieces.feed(&wire.as_bytes()[split..]));
            prop_assert_eq!(got, expected);
        }
    }
}
