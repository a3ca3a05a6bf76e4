//! The broadcast hub.
//!
//! A [`Hub`] is a cheap, cloneable handle. The connected-client set lives in a
//! single [`EventLoop`] task and is never touched from anywhere else: every
//! registration, deregistration and broadcast is a message into that task.
//!
//! ```text
//!   register ──► connect ────┐
//! unregister ──► disconnect ─┤
//!       send ──► messages ───┼──► EventLoop { clients } ──► Client::send / Client::close
//!       stop ──► stop ───────┘
//! ```
//!
//! Shutdown drains: `stop` closes every client and only returns once each of
//! them has unregistered.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tokio::{
    select,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    client::{Admission, Client, ClientId},
    error::HubError,
};

/// Lifecycle of the hub. The only legal path is
/// `Stopped -> Started -> Stopping -> Stopped`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HubState {
    #[default]
    Stopped,
    Started,
    Stopping,
}

impl fmt::Display for HubState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HubState::Stopped => f.write_str("stopped"),
            HubState::Started => f.write_str("started"),
            HubState::Stopping => f.write_str("stopping"),
        }
    }
}

/// Handle to the broadcast hub. Clones share the same event loop.
#[derive(Clone, Default)]
pub struct Hub {
    shared: Arc<Mutex<Shared>>,
}

#[derive(Default)]
struct Shared {
    state: HubState,
    channels: Option<Channels>,
    shutdown: Option<Shutdown>,
}

/// Senders into the running event loop.
#[derive(Clone)]
struct Channels {
    connect: mpsc::Sender<ConnectRequest>,
    disconnect: mpsc::Sender<DisconnectRequest>,
    messages: mpsc::Sender<Broadcast>,
}

struct Shutdown {
    stop: oneshot::Sender<()>,
    event_loop: JoinHandle<()>,
}

struct ConnectRequest {
    client: Arc<dyn Client>,
    respond_to: oneshot::Sender<Admission>,
}

struct DisconnectRequest {
    id: ClientId,
    respond_to: oneshot::Sender<()>,
}

struct Broadcast {
    message: String,
    respond_to: oneshot::Sender<usize>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> HubState {
        self.lock().state
    }

    /// Launches the event loop.
    ///
    /// Must be called from within a Tokio runtime. Calling it again while the
    /// hub is already started is a no-op.
    pub fn start(&self) -> Result<(), HubError> {
        let mut shared = self.lock();
        match shared.state {
            HubState::Started => return Ok(()),
            HubState::Stopped => {}
            from => {
                return Err(HubError::InvalidState {
                    from,
                    to: HubState::Started,
                });
            }
        }

        // Capacity 1 keeps each hand-off close to a rendezvous; callers also
        // wait for the loop's reply.
        let (connect_tx, connect_rx) = mpsc::channel(1);
        let (disconnect_tx, disconnect_rx) = mpsc::channel(1);
        let (messages_tx, messages_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = oneshot::channel();

        let event_loop = EventLoop {
            clients: HashMap::new(),
            connect_rx,
            disconnect_rx,
            messages_rx,
            stop_rx,
            exiting: false,
        };

        info!("starting realtime hub");
        // The loop task finishes the move to `Stopped` itself, so a `stop`
        // future dropped mid-drain still leaves the hub restartable.
        let shared_state = Arc::clone(&self.shared);
        let event_loop = tokio::spawn(async move {
            event_loop.run().await;
            lock(&shared_state).finish_stop();
            info!("realtime hub stopped");
        });

        shared.channels = Some(Channels {
            connect: connect_tx,
            disconnect: disconnect_tx,
            messages: messages_tx,
        });
        shared.shutdown = Some(Shutdown {
            stop: stop_tx,
            event_loop,
        });
        shared.state = HubState::Started;
        Ok(())
    }

    /// Closes every registered client and waits until all of them have
    /// unregistered, then returns the hub to `Stopped`.
    ///
    /// Dropping the returned future does not abort the shutdown: the drain
    /// carries on and the hub still reaches `Stopped` once it is empty.
    pub async fn stop(&self) -> Result<(), HubError> {
        let shutdown = {
            let mut shared = self.lock();
            if shared.state != HubState::Started {
                return Err(HubError::InvalidState {
                    from: shared.state,
                    to: HubState::Stopping,
                });
            }
            shared.state = HubState::Stopping;
            shared.shutdown.take()
        };

        info!("stopping realtime hub, waiting for all clients to disconnect");

        let Some(Shutdown { stop, event_loop }) = shutdown else {
            self.lock().finish_stop();
            return Ok(());
        };

        let _ = stop.send(());
        if let Err(err) = event_loop.await {
            warn!(error = ?err, "hub event loop ended abnormally");
            self.lock().finish_stop();
        }
        Ok(())
    }

    /// Broadcasts `message` to every client registered when the event loop
    /// picks it up, and returns how many clients it was queued for.
    ///
    /// Waits until the loop has accepted the message; nothing is dropped when
    /// the loop is busy.
    pub async fn send(&self, message: impl Into<String>) -> Result<usize, HubError> {
        let channels = self.channels().ok_or(HubError::NotRunning)?;
        let (respond_to, accepted) = oneshot::channel();

        channels
            .messages
            .send(Broadcast {
                message: message.into(),
                respond_to,
            })
            .await
            .map_err(|_| HubError::NotRunning)?;

        accepted.await.map_err(|_| HubError::NotRunning)
    }

    /// Asks the hub to admit `client`.
    ///
    /// A client offered while the hub is stopping, or while no loop runs, is
    /// closed on the spot and reported as [`Admission::Rejected`].
    pub async fn register(&self, client: Arc<dyn Client>) -> Admission {
        let channels = {
            let shared = self.lock();
            match shared.state {
                HubState::Started => shared.channels.clone(),
                _ => None,
            }
        };
        let Some(channels) = channels else {
            client.close();
            return Admission::Rejected;
        };

        let offered = Arc::clone(&client);
        let (respond_to, admission) = oneshot::channel();
        if channels
            .connect
            .send(ConnectRequest { client, respond_to })
            .await
            .is_err()
        {
            offered.close();
            return Admission::Rejected;
        }

        match admission.await {
            Ok(admission) => admission,
            Err(_) => {
                offered.close();
                Admission::Rejected
            }
        }
    }

    /// Asks the hub to forget `client`. Unknown clients are ignored.
    ///
    /// Returns once the loop has processed the request, so the caller may
    /// close its outbound queue knowing the hub will not push to it again.
    pub async fn unregister(&self, client: &dyn Client) {
        let Some(channels) = self.channels() else {
            return;
        };

        let (respond_to, done) = oneshot::channel();
        let request = DisconnectRequest {
            id: client.id(),
            respond_to,
        };
        if channels.disconnect.send(request).await.is_ok() {
            let _ = done.await;
        }
    }

    fn channels(&self) -> Option<Channels> {
        self.lock().channels.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        lock(&self.shared)
    }
}

impl Shared {
    fn finish_stop(&mut self) {
        self.channels = None;
        self.shutdown = None;
        self.state = HubState::Stopped;
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sole owner of the client set.
///
/// The number of entries in `clients` is the outstanding-client count: a
/// client is counted from admission until its unregister is processed.
struct EventLoop {
    clients: HashMap<ClientId, Arc<dyn Client>>,
    connect_rx: mpsc::Receiver<ConnectRequest>,
    disconnect_rx: mpsc::Receiver<DisconnectRequest>,
    messages_rx: mpsc::Receiver<Broadcast>,
    stop_rx: oneshot::Receiver<()>,
    exiting: bool,
}

impl EventLoop {
    async fn run(mut self) {
        loop {
            if self.exiting && self.clients.is_empty() {
                break;
            }

            // No `biased;`: branches are polled in random order so no event
            // kind can starve another.
            select! {
                _ = &mut self.stop_rx, if !self.exiting => self.begin_exit(),
                Some(broadcast) = self.messages_rx.recv() => self.broadcast(broadcast),
                Some(request) = self.connect_rx.recv() => self.admit(request),
                Some(request) = self.disconnect_rx.recv() => self.remove(request),
                else => break,
            }
        }

        self.reject_pending();
        debug!("hub event loop exited");
    }

    fn begin_exit(&mut self) {
        self.exiting = true;
        info!(clients = self.clients.len(), "hub exiting, closing clients");
        for client in self.clients.values() {
            client.close();
        }
    }

    fn broadcast(&mut self, Broadcast { message, respond_to }: Broadcast) {
        for client in self.clients.values() {
            client.send(&message);
        }
        debug!(clients = self.clients.len(), "broadcast message");
        let _ = respond_to.send(self.clients.len());
    }

    fn admit(&mut self, ConnectRequest { client, respond_to }: ConnectRequest) {
        if self.exiting {
            debug!(client = %client.id(), kind = %client.kind(), "rejecting client, hub is exiting");
            client.close();
            let _ = respond_to.send(Admission::Rejected);
            return;
        }

        let id = client.id();
        let kind = client.kind();
        if self.clients.insert(id, client).is_some() {
            debug!(client = %id, "client registered twice");
        }
        info!(client = %id, %kind, clients = self.clients.len(), "client connected");
        let _ = respond_to.send(Admission::Admitted);
    }

    fn remove(&mut self, DisconnectRequest { id, respond_to }: DisconnectRequest) {
        match self.clients.remove(&id) {
            Some(client) => info!(
                client = %id,
                kind = %client.kind(),
                clients = self.clients.len(),
                "client disconnected"
            ),
            None => debug!(client = %id, "ignoring unregister for unknown client"),
        }
        let _ = respond_to.send(());
    }

    /// Connect requests still buffered once the loop is done would otherwise
    /// be dropped silently.
    fn reject_pending(&mut self) {
        self.connect_rx.close();
        while let Ok(ConnectRequest { client, respond_to }) = self.connect_rx.try_recv() {
            client.close();
            let _ = respond_to.send(Admission::Rejected);
        }
    }
}
