//! Live circuit, stream and OR-connection records.
//!
//! [`StatusRegistry`] keeps the latest snapshot of every entity Tor reports
//! through CIRC, STREAM and ORCONN events. Each of the three sets has its own
//! lock and a fixed capacity.
//!
//! # Capacity
//!
//! ```text
//!   new id arrives, set is full
//!          │
//!          ├── a Closed/Failed record exists ──► evict the first one, insert
//!          │
//!          └── none terminal ─────────────────► drop the new record
//! ```
//!
//! # Updates
//!
//! | Situation | Effect |
//! |-----------|--------|
//! | unknown id | insert (subject to capacity) |
//! | known, live circuit | every field overwritten except resolved routers |
//! | known stream | status, circuit, purpose and reason; target kept |
//! | known, terminal | status (if terminal) and reason only; paths stay frozen |
//!
//! Circuit routers are re-resolved only when a live circuit is first seen
//! with a path, when its path length changes or when it reports EXTENDED.
//! A Closed or Failed report never triggers resolution.
//!
//! Readers always receive cloned snapshots taken under the lock.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::circuit::{Circuit, CircuitStatus};
use crate::commands;
use crate::config::LogLevel;
use crate::connection::ControlEndpoint;
use crate::events::{EventKind, EventSession, Subscription, TorEvent};
use crate::logger::plog;
use crate::orconn::OrConnection;
use crate::router::Router;
use crate::stream::Stream;

/// Default capacity of each record set.
pub const MAXIMUM_RECORDS: usize = 30;

/// Which record set changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistryChange {
    /// The circuit set changed.
    Circuits,
    /// The stream set changed.
    Streams,
    /// The OR-connection set changed.
    OrConnections,
}

trait Record {
    fn same_record(&self, other: &Self) -> bool;
    fn terminal(&self) -> bool;
}

impl Record for Circuit {
    fn same_record(&self, other: &Self) -> bool {
        self.id == other.id
    }

    fn terminal(&self) -> bool {
        self.is_terminal()
    }
}

impl Record for Stream {
    fn same_record(&self, other: &Self) -> bool {
        self.id == other.id
    }

    fn terminal(&self) -> bool {
        self.is_terminal()
    }
}

impl Record for OrConnection {
    fn same_record(&self, other: &Self) -> bool {
        self.same_connection(other)
    }

    fn terminal(&self) -> bool {
        self.is_terminal()
    }
}

enum Applied {
    Inserted,
    Updated,
    Dropped,
}

/// Inserts `incoming` or merges it into the matching record.
fn upsert<T: Record>(
    records: &mut Vec<T>,
    capacity: usize,
    incoming: T,
    merge: impl FnOnce(&mut T, T),
) -> Applied {
    if let Some(existing) = records.iter_mut().find(|r| r.same_record(&incoming)) {
        merge(existing, incoming);
        return Applied::Updated;
    }

    if records.len() >= capacity {
        match records.iter().position(|r| r.terminal()) {
            Some(index) => {
                records.remove(index);
            }
            None => return Applied::Dropped,
        }
    }
    records.push(incoming);
    Applied::Inserted
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Bounded, de-duplicated sets of live entities.
pub struct StatusRegistry {
    capacity: usize,
    circuits: Mutex<Vec<Circuit>>,
    streams: Mutex<Vec<Stream>>,
    or_connections: Mutex<Vec<OrConnection>>,
    changes: broadcast::Sender<RegistryChange>,
}

impl Default for StatusRegistry {
    fn default() -> Self {
        Self::new(MAXIMUM_RECORDS)
    }
}

impl StatusRegistry {
    /// Creates a registry holding at most `capacity` records per set.
    pub fn new(capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            capacity,
            circuits: Mutex::new(Vec::new()),
            streams: Mutex::new(Vec::new()),
            or_connections: Mutex::new(Vec::new()),
            changes,
        }
    }

    /// Capacity of each record set.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Snapshot of the tracked circuits.
    pub fn circuits(&self) -> Vec<Circuit> {
        locked(&self.circuits).clone()
    }

    /// Snapshot of one circuit.
    pub fn circuit(&self, id: u64) -> Option<Circuit> {
        locked(&self.circuits).iter().find(|c| c.id == id).cloned()
    }

    /// Snapshot of the tracked streams.
    pub fn streams(&self) -> Vec<Stream> {
        locked(&self.streams).clone()
    }

    /// Snapshot of the tracked OR connections.
    pub fn or_connections(&self) -> Vec<OrConnection> {
        locked(&self.or_connections).clone()
    }

    /// Receives a notification after every mutation.
    pub fn changes(&self) -> broadcast::Receiver<RegistryChange> {
        self.changes.subscribe()
    }

    fn notify(&self, change: RegistryChange) {
        let _ = self.changes.send(change);
    }

    /// Applies a circuit snapshot.
    ///
    /// Returns true when the circuit's routers should be resolved again.
    pub fn apply_circuit(&self, circuit: Circuit) -> bool {
        let mut resolve = false;
        let applied = {
            let mut circuits = locked(&self.circuits);
            let needs_paths = !circuit.paths.is_empty() && !circuit.is_terminal();
            let applied = upsert(&mut circuits, self.capacity, circuit, |existing, incoming| {
                if existing.is_terminal() {
                    if incoming.is_terminal() {
                        existing.status = incoming.status;
                    }
                    existing.reason = incoming.reason;
                    return;
                }

                resolve = !incoming.is_terminal()
                    && (existing.paths.len() != incoming.paths.len()
                        || incoming.status == CircuitStatus::Extended);
                let routers = std::mem::take(&mut existing.routers);
                *existing = Circuit {
                    routers,
                    ..incoming
                };
            });
            if matches!(applied, Applied::Inserted) {
                resolve = needs_paths;
            }
            applied
        };

        if !matches!(applied, Applied::Dropped) {
            self.notify(RegistryChange::Circuits);
        }
        resolve
    }

    /// Stores resolved routers for a live circuit.
    ///
    /// Returns false when the circuit is gone or already terminal.
    pub fn set_circuit_routers(&self, id: u64, routers: Vec<Router>) -> bool {
        let updated = {
            let mut circuits = locked(&self.circuits);
            match circuits.iter_mut().find(|c| c.id == id) {
                Some(circuit) if !circuit.is_terminal() => {
                    circuit.routers = routers;
                    true
                }
                _ => false,
            }
        };
        if updated {
            self.notify(RegistryChange::Circuits);
        }
        updated
    }

    /// Applies a stream snapshot.
    ///
    /// A known stream keeps the target it was first reported with.
    pub fn apply_stream(&self, stream: Stream) {
        let applied = upsert(
            &mut locked(&self.streams),
            self.capacity,
            stream,
            |existing, incoming| {
                existing.circuit_id = incoming.circuit_id;
                existing.purpose = incoming.purpose;
                existing.reason = incoming.reason;
                existing.status = incoming.status;
            },
        );
        if !matches!(applied, Applied::Dropped) {
            self.notify(RegistryChange::Streams);
        }
    }

    /// Applies an OR-connection snapshot.
    pub fn apply_or_connection(&self, connection: OrConnection) {
        let applied = upsert(
            &mut locked(&self.or_connections),
            self.capacity,
            connection,
            |existing, incoming| {
                let id = if incoming.id != 0 { incoming.id } else { existing.id };
                *existing = OrConnection { id, ..incoming };
            },
        );
        if !matches!(applied, Applied::Dropped) {
            self.notify(RegistryChange::OrConnections);
        }
    }
}

/// Keeps a registry fed from an event session.
///
/// Dropping the attachment unsubscribes and stops router resolution.
pub struct RegistryAttachment {
    _subscriptions: Vec<Subscription>,
    resolver: JoinHandle<()>,
}

impl Drop for RegistryAttachment {
    fn drop(&mut self) {
        self.resolver.abort();
    }
}

/// Subscribes `registry` to CIRC, STREAM and ORCONN events of `session`.
///
/// Router resolution runs in its own task, one GETINFO per path entry.
pub fn attach(
    registry: Arc<StatusRegistry>,
    session: &EventSession,
    endpoint: ControlEndpoint,
) -> RegistryAttachment {
    let (resolve_tx, resolve_rx) = mpsc::unbounded_channel::<(u64, Vec<String>)>();

    let circuits = Arc::clone(&registry);
    let circuit_subscription = session.subscribe(EventKind::Circuit, move |event| {
        if let TorEvent::Circuit(circuit) = event {
            let identities = circuit.router_identities();
            if circuits.apply_circuit(circuit.clone()) {
                let _ = resolve_tx.send((circuit.id, identities));
            }
        }
    });

    let streams = Arc::clone(&registry);
    let stream_subscription = session.subscribe(EventKind::Stream, move |event| {
        if let TorEvent::Stream(stream) = event {
            streams.apply_stream(stream.clone());
        }
    });

    let connections = Arc::clone(&registry);
    let orconn_subscription = session.subscribe(EventKind::OrConnection, move |event| {
        if let TorEvent::OrConnection(connection) = event {
            connections.apply_or_connection(connection.clone());
        }
    });

    let resolver = tokio::spawn(resolve_routers(registry, endpoint, resolve_rx));

    RegistryAttachment {
        _subscriptions: vec![circuit_subscription, stream_subscription, orconn_subscription],
        resolver,
    }
}

async fn resolve_routers(
    registry: Arc<StatusRegistry>,
    endpoint: ControlEndpoint,
    mut requests: mpsc::UnboundedReceiver<(u64, Vec<String>)>,
) {
    while let Some((id, identities)) = requests.recv().await {
        let mut routers = Vec::with_capacity(identities.len());
        for identity in &identities {
            match commands::get_router_status(&endpoint, identity).await {
                Ok(router) => routers.push(router),
                Err(e) => plog(
                    LogLevel::Debug,
                    &format!("could not resolve router {} on circuit {}: {}", identity, id, e),
                ),
            }
        }
        registry.set_circuit_routers(id, routers);
    }
}
