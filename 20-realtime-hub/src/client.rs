//! The capability every transport client exposes to the hub.
//!
//! The hub only ever sees `Arc<dyn Client>`: it can queue a message on a
//! client and force it to close. Everything else (reading frames, writing
//! them, deciding when the connection is dead) belongs to the transport.

use std::{
    fmt,
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::sync::mpsc;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one connection, allocated when the client is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    pub fn next() -> Self {
        Self(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which transport a client speaks. Only used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    Duplex,
    Push,
}

impl fmt::Display for ClientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientKind::Duplex => f.write_str("websocket"),
            ClientKind::Push => f.write_str("sse"),
        }
    }
}

pub trait Client: Send + Sync + 'static {
    fn id(&self) -> ClientId;

    fn kind(&self) -> ClientKind;

    /// Queue `message` for delivery to the remote peer.
    ///
    /// Called by the hub's event loop only, and only while the client is
    /// registered. Must not block.
    fn send(&self, message: &str);

    /// Force the client to terminate. The client's own run loop notices,
    /// unregisters itself and closes its queue.
    fn close(&self);
}

/// Outcome of [`Hub::register`](crate::hub::Hub::register).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// The hub is stopping (or not running); the client has already been
    /// closed and should wind down like any other closed connection.
    Rejected,
}

/// Outbound queue of one client.
///
/// Written by the hub loop, drained by the client's writer task. Closing is
/// one-shot: the first `close` drops the sender so the reader sees the end of
/// the queue, later calls do nothing, and pushes after close are refused.
#[derive(Debug)]
pub struct Outbox {
    tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl Outbox {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Returns `false` when the queue is closed or its reader is gone.
    pub fn push(&self, message: String) -> bool {
        let guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }

    /// Returns `true` only for the call that actually closed the queue.
    pub fn close(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}
