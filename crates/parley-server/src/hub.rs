//! The hub: one coordination loop owning the set of live connections.
//!
//! Connections never touch the live set directly. They submit
//! registrations, unregistrations and broadcasts through a [`HubHandle`],
//! and the loop started by [`Hub::run`] applies them one at a time.
//!
//! Fan-out never blocks: a connection whose outbound queue is full is
//! evicted on the spot and its queue closed, which makes its outbound
//! pump send a close frame.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use parley_core::ids::ConnectionId;

/// A serialized message, shared by every queue it is fanned out to.
pub type Frame = Arc<String>;

/// Capacity of each intake channel.
const INTAKE_CAPACITY: usize = 64;

/// Who a broadcast is for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Delivery {
    All,
    Only(ConnectionId),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HubError {
    #[error("hub is not running")]
    Stopped,
}

struct Registration {
    id: ConnectionId,
    outbound: mpsc::Sender<Frame>,
    ack: oneshot::Sender<()>,
}

struct Broadcast {
    payload: Frame,
    delivery: Delivery,
}

#[derive(Debug, Default)]
struct HubStats {
    live: AtomicUsize,
    broadcasts: AtomicU64,
    delivered: AtomicU64,
    evictions: AtomicU64,
}

/// Point-in-time copy of the hub counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HubSnapshot {
    pub live_connections: usize,
    pub broadcasts: u64,
    pub delivered: u64,
    pub evictions: u64,
}

/// Why a member could not take a frame.
enum Refusal {
    Full,
    Closed,
}

/// Live set plus counters. Only ever touched from inside the hub loop.
struct LiveSet {
    members: HashMap<ConnectionId, mpsc::Sender<Frame>>,
    stats: Arc<HubStats>,
}

impl LiveSet {
    fn new(stats: Arc<HubStats>) -> Self {
        Self {
            members: HashMap::new(),
            stats,
        }
    }

    fn admit(&mut self, id: ConnectionId, outbound: mpsc::Sender<Frame>) {
        if self.members.insert(id.clone(), outbound).is_some() {
            warn!(conn_id = %id, "connection registered twice, previous queue closed");
        }
        debug!(conn_id = %id, live = self.members.len(), "connection registered");
        self.sync_live();
    }

    /// Dropping the sender closes the connection's outbound queue.
    fn remove(&mut self, id: &ConnectionId) -> bool {
        let removed = self.members.remove(id).is_some();
        if removed {
            debug!(conn_id = %id, live = self.members.len(), "connection unregistered");
            self.sync_live();
        }
        removed
    }

    fn fan_out(&mut self, broadcast: Broadcast) {
        let _ = self.stats.broadcasts.fetch_add(1, Ordering::Relaxed);
        let mut dropped = Vec::new();

        match &broadcast.delivery {
            Delivery::All => {
                for (id, outbound) in &self.members {
                    if let Some(reason) = offer(&self.stats, outbound, &broadcast.payload) {
                        dropped.push((id.clone(), reason));
                    }
                }
            }
            Delivery::Only(id) => {
                if let Some(outbound) = self.members.get(id) {
                    if let Some(reason) = offer(&self.stats, outbound, &broadcast.payload) {
                        dropped.push((id.clone(), reason));
                    }
                }
            }
        }

        for (id, reason) in dropped {
            let _ = self.members.remove(&id);
            match reason {
                Refusal::Full => {
                    let _ = self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                    warn!(conn_id = %id, "outbound queue full, evicting slow connection");
                }
                Refusal::Closed => {
                    debug!(conn_id = %id, "outbound queue closed, dropping connection");
                }
            }
        }
        self.sync_live();
    }

    fn clear(&mut self) {
        self.members.clear();
        self.sync_live();
    }

    fn sync_live(&self) {
        self.stats.live.store(self.members.len(), Ordering::Relaxed);
    }
}

/// Non-blocking enqueue. Returns why the connection must go, if it must.
fn offer(stats: &HubStats, outbound: &mpsc::Sender<Frame>, payload: &Frame) -> Option<Refusal> {
    match outbound.try_send(Arc::clone(payload)) {
        Ok(()) => {
            let _ = stats.delivered.fetch_add(1, Ordering::Relaxed);
            None
        }
        Err(TrySendError::Full(_)) => Some(Refusal::Full),
        Err(TrySendError::Closed(_)) => Some(Refusal::Closed),
    }
}

/// The coordination loop. Create with [`Hub::new`], then drive with [`Hub::run`].
pub struct Hub {
    live: LiveSet,
    register_rx: mpsc::Receiver<Registration>,
    unregister_rx: mpsc::Receiver<ConnectionId>,
    broadcast_rx: mpsc::Receiver<Broadcast>,
}

impl Hub {
    pub fn new() -> (Self, HubHandle) {
        let (register_tx, register_rx) = mpsc::channel(INTAKE_CAPACITY);
        let (unregister_tx, unregister_rx) = mpsc::channel(INTAKE_CAPACITY);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(INTAKE_CAPACITY);
        let stats = Arc::new(HubStats::default());

        let hub = Self {
            live: LiveSet::new(Arc::clone(&stats)),
            register_rx,
            unregister_rx,
            broadcast_rx,
        };
        let handle = HubHandle {
            register_tx,
            unregister_tx,
            broadcast_tx,
            stats,
        };
        (hub, handle)
    }

    /// Run until `shutdown` is cancelled. Every live queue is closed on exit.
    pub async fn run(self, shutdown: CancellationToken) {
        let Hub {
            mut live,
            mut register_rx,
            mut unregister_rx,
            mut broadcast_rx,
        } = self;

        info!("hub started");
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                Some(reg) = register_rx.recv() => {
                    live.admit(reg.id, reg.outbound);
                    let _ = reg.ack.send(());
                }
                Some(id) = unregister_rx.recv() => {
                    let _ = live.remove(&id);
                }
                Some(broadcast) = broadcast_rx.recv() => live.fan_out(broadcast),
                else => break,
            }
        }

        let remaining = live.members.len();
        live.clear();
        info!(closed = remaining, "hub stopped");
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}

/// Cloneable entry point to a running [`Hub`].
#[derive(Clone)]
pub struct HubHandle {
    register_tx: mpsc::Sender<Registration>,
    unregister_tx: mpsc::Sender<ConnectionId>,
    broadcast_tx: mpsc::Sender<Broadcast>,
    stats: Arc<HubStats>,
}

impl HubHandle {
    /// Add a connection to the live set. Resolves once the hub has applied it.
    pub async fn register(
        &self,
        id: ConnectionId,
        outbound: mpsc::Sender<Frame>,
    ) -> Result<(), HubError> {
        let (ack, acked) = oneshot::channel();
        self.register_tx
            .send(Registration { id, outbound, ack })
            .await
            .map_err(|_| HubError::Stopped)?;
        acked.await.map_err(|_| HubError::Stopped)
    }

    /// Remove a connection. Unknown or already-removed ids are a no-op.
    pub async fn unregister(&self, id: &ConnectionId) {
        if self.unregister_tx.send(id.clone()).await.is_err() {
            debug!(conn_id = %id, "hub stopped, unregister dropped");
        }
    }

    pub async fn broadcast(&self, payload: Frame, delivery: Delivery) -> Result<(), HubError> {
        self.broadcast_tx
            .send(Broadcast { payload, delivery })
            .await
            .map_err(|_| HubError::Stopped)
    }

    pub fn stats(&self) -> HubSnapshot {
        HubSnapshot {
            live_connections: self.stats.live.load(Ordering::Relaxed),
            broadcasts: self.stats.broadcasts.load(Ordering::Relaxed),
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
        }
    }
}
