//! WebSocket clients.
//!
//! A duplex client runs two loops over one socket. The reader forwards every
//! inbound text frame to [`Hub::send`], so messages are echoed to all clients
//! including the sender. The writer drains the client's outbound queue into
//! text frames. Whichever side notices the connection is gone first cancels
//! the shared token; cleanup then runs once, after the reader has returned.

use std::sync::{Arc, Mutex, PoisonError};

use axum::extract::ws::{Message, WebSocket};
use futures_util::{Sink, SinkExt, StreamExt, stream::SplitStream};
use tokio::{select, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    client::{Admission, Client, ClientId, ClientKind, Outbox},
    error::ClientError,
    hub::Hub,
};

pub struct DuplexClient {
    id: ClientId,
    hub: Hub,
    outbox: Outbox,
    queue: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    closed: CancellationToken,
}

impl DuplexClient {
    pub fn new(hub: Hub) -> Arc<Self> {
        let (outbox, queue) = Outbox::new();
        Arc::new(Self {
            id: ClientId::next(),
            hub,
            outbox,
            queue: Mutex::new(Some(queue)),
            closed: CancellationToken::new(),
        })
    }

    /// Registers with the hub and serves `socket` until either side goes away
    /// or the hub closes the client.
    pub async fn run(self: Arc<Self>, mut socket: WebSocket) -> Result<(), ClientError> {
        let queue = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(ClientError::AlreadyRunning)?;

        if self.hub.register(self.clone()).await == Admission::Rejected {
            debug!(client = %self.id, "websocket client rejected, closing connection");
            self.outbox.close();
            let _ = socket.send(Message::Close(None)).await;
            return Ok(());
        }

        let (sink, stream) = socket.split();
        let writer = tokio::spawn(write_frames(sink, queue, self.closed.clone()));

        let read_result = self.read_frames(stream).await;
        self.cleanup().await;

        let write_result = match writer.await {
            Ok(result) => result,
            Err(err) => {
                warn!(client = %self.id, error = ?err, "websocket writer task failed");
                Ok(())
            }
        };

        read_result.and(write_result)
    }

    async fn read_frames(&self, mut stream: SplitStream<WebSocket>) -> Result<(), ClientError> {
        loop {
            let frame = select! {
                _ = self.closed.cancelled() => return Ok(()),
                frame = stream.next() => frame,
            };

            match frame {
                Some(Ok(Message::Text(text))) => self.forward(text).await,
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => self.forward(text).await,
                    Err(_) => debug!(client = %self.id, "dropping non-utf8 binary frame"),
                },
                // Pings are answered by the protocol layer.
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => return Ok(()),
                Some(Err(err)) => return Err(err.into()),
            }
        }
    }

    async fn forward(&self, text: String) {
        if let Err(err) = self.hub.send(text).await {
            debug!(client = %self.id, error = %err, "dropping inbound message");
        }
    }

    /// Close the connection, leave the hub, then close the queue.
    async fn cleanup(&self) {
        self.closed.cancel();
        self.hub.unregister(self).await;
        self.outbox.close();
    }
}

impl Client for DuplexClient {
    fn id(&self) -> ClientId {
        self.id
    }

    fn kind(&self) -> ClientKind {
        ClientKind::Duplex
    }

    fn send(&self, message: &str) {
        if !self.outbox.push(message.to_owned()) {
            debug!(client = %self.id, "outbound queue closed, message dropped");
        }
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

async fn write_frames<S>(
    mut sink: S,
    mut queue: mpsc::UnboundedReceiver<String>,
    closed: CancellationToken,
) -> Result<(), ClientError>
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    let result = loop {
        select! {
            _ = closed.cancelled() => break Ok(()),
            message = queue.recv() => match message {
                Some(text) => {
                    if let Err(err) = sink.send(Message::Text(text)).await {
                        break Err(ClientError::from(err));
                    }
                }
                None => break Ok(()),
            },
        }
    };

    // A failed write must also stop the reader.
    closed.cancel();
    let _ = sink.close().await;
    result
}
