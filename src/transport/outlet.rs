//! Outlet fan-out
//!
//! The outlet is the publish side of a data-plane socket. It keeps a registry
//! of peers, each with its set of subscribed topic prefixes, and copies every
//! published frame to each peer holding a prefix that literally prefixes the
//! frame. Peers are either remote WebSocket connections or in-process taps.
//!
//! Concurrency note: the outlet is shared as `Arc<Mutex<Outlet>>`. Callers
//! only ever hold the lock while queueing frames, never across network I/O.
//!
//! Remote peers get a bounded queue of `PEER_QUEUE_CAPACITY` frames; once a
//! stalled connection fills it, further frames for that peer are dropped
//! rather than buffered. In-process taps are drained by the broker itself
//! and stay unbounded.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{self, Sender, UnboundedReceiver, UnboundedSender};
use tracing::debug;
use uuid::Uuid;

pub type PeerId = String;
pub type SharedOutlet = Arc<Mutex<Outlet>>;

/// Frames a remote peer may have queued before new ones are dropped.
pub const PEER_QUEUE_CAPACITY: usize = 1000;

#[derive(Debug)]
pub enum PeerQueue {
    Bounded(Sender<Vec<u8>>),
    Unbounded(UnboundedSender<Vec<u8>>),
}

enum Offer {
    Queued,
    Full,
    Closed,
}

impl PeerQueue {
    fn offer(&self, frame: &[u8]) -> Offer {
        match self {
            PeerQueue::Bounded(tx) => match tx.try_send(frame.to_vec()) {
                Ok(()) => Offer::Queued,
                Err(TrySendError::Full(_)) => Offer::Full,
                Err(TrySendError::Closed(_)) => Offer::Closed,
            },
            PeerQueue::Unbounded(tx) => match tx.send(frame.to_vec()) {
                Ok(()) => Offer::Queued,
                Err(_) => Offer::Closed,
            },
        }
    }
}

impl From<Sender<Vec<u8>>> for PeerQueue {
    fn from(tx: Sender<Vec<u8>>) -> Self {
        PeerQueue::Bounded(tx)
    }
}

impl From<UnboundedSender<Vec<u8>>> for PeerQueue {
    fn from(tx: UnboundedSender<Vec<u8>>) -> Self {
        PeerQueue::Unbounded(tx)
    }
}

#[derive(Debug)]
pub struct Peer {
    pub id: PeerId,
    pub queue: PeerQueue,
    pub prefixes: BTreeSet<String>,
    /// Frames dropped because the queue was full.
    pub dropped: u64,
}

impl Peer {
    fn wants(&self, frame: &[u8]) -> bool {
        self.prefixes
            .iter()
            .any(|prefix| frame.starts_with(prefix.as_bytes()))
    }
}

#[derive(Debug, Default)]
pub struct Outlet {
    pub peers: HashMap<PeerId, Peer>,
}

impl Outlet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedOutlet {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Register a peer with no subscriptions.
    pub fn register(&mut self, queue: impl Into<PeerQueue>) -> PeerId {
        let id = format!("peer-{}", Uuid::new_v4());
        self.peers.insert(
            id.clone(),
            Peer {
                id: id.clone(),
                queue: queue.into(),
                prefixes: BTreeSet::new(),
                dropped: 0,
            },
        );
        id
    }

    /// Attach an in-process tap subscribed to `prefix`.
    pub fn attach(&mut self, prefix: &str) -> (PeerId, UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.register(tx);
        self.subscribe(&id, prefix);
        (id, rx)
    }

    pub fn subscribe(&mut self, peer: &PeerId, prefix: &str) {
        if let Some(peer) = self.peers.get_mut(peer) {
            peer.prefixes.insert(prefix.to_string());
        }
    }

    pub fn unsubscribe(&mut self, peer: &PeerId, prefix: &str) {
        if let Some(peer) = self.peers.get_mut(peer) {
            peer.prefixes.remove(prefix);
        }
    }

    pub fn remove(&mut self, peer: &PeerId) {
        self.peers.remove(peer);
    }

    /// Queue `frame` for every interested peer. Peers whose channel has
    /// closed are removed; peers whose queue is full miss this frame.
    /// Returns the number of peers the frame was queued for.
    pub fn publish(&mut self, frame: &[u8]) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();
        for peer in self.peers.values_mut() {
            if !peer.wants(frame) {
                continue;
            }
            match peer.queue.offer(frame) {
                Offer::Queued => delivered += 1,
                Offer::Full => {
                    if peer.dropped == 0 {
                        debug!("outlet peer {} is not keeping up, dropping frames", peer.id);
                    }
                    peer.dropped += 1;
                }
                Offer::Closed => closed.push(peer.id.clone()),
            }
        }
        for id in closed {
            debug!("dropping closed outlet peer {id}");
            self.peers.remove(&id);
        }
        delivered
    }
}
