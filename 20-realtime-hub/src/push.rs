//! Server-Sent Events clients.
//!
//! The response body of `/sse` is fed by a channel. The client's run loop is
//! the only writer into that channel, and the HTTP server drops the other end
//! when the request goes away, which is how the loop learns about the
//! disconnect.

use std::{
    convert::Infallible,
    sync::{Arc, Mutex, PoisonError},
};

use axum::{
    body::Body,
    http::header,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::{select, sync::mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    client::{Admission, Client, ClientId, ClientKind, Outbox},
    error::ClientError,
    hub::Hub,
};

/// Frames buffered between the run loop and the HTTP body.
const BODY_BUFFER: usize = 16;

/// Encodes one message as an event-stream frame. The payload is written
/// verbatim.
pub fn frame(message: &str) -> Bytes {
    Bytes::from(format!("data: {message}\n\n"))
}

pub struct PushClient {
    id: ClientId,
    hub: Hub,
    outbox: Outbox,
    queue: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    closed: CancellationToken,
}

impl PushClient {
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

    /// Builds the streaming `text/event-stream` response and spawns the run
    /// loop that feeds it.
    pub fn into_stream_response(self: Arc<Self>) -> Response {
        let (sink, body) = mpsc::channel(BODY_BUFFER);

        tokio::spawn(async move {
            let id = self.id;
            if let Err(err) = self.run(sink).await {
                warn!(client = %id, error = %err, "sse client ended with error");
            }
        });

        let body = ReceiverStream::new(body).map(Ok::<_, Infallible>);
        (
            [
                (header::CONTENT_TYPE, "text/event-stream"),
                (header::CACHE_CONTROL, "no-cache"),
                (header::CONNECTION, "keep-alive"),
                (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
                (header::ACCESS_CONTROL_EXPOSE_HEADERS, "Content-Type"),
            ],
            Body::from_stream(body),
        )
            .into_response()
    }

    /// Registers with the hub and writes one frame per queued message into
    /// `sink` until the reader of `sink` goes away or the hub closes the
    /// client.
    pub async fn run(self: Arc<Self>, sink: mpsc::Sender<Bytes>) -> Result<(), ClientError> {
        let mut queue = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(ClientError::AlreadyRunning)?;

        if self.hub.register(self.clone()).await == Admission::Rejected {
            debug!(client = %self.id, "sse client rejected, closing stream");
            self.outbox.close();
            return Ok(());
        }

        let result = self.pump(&mut queue, &sink).await;

        self.hub.unregister(&*self).await;
        self.outbox.close();
        result
    }

    async fn pump(
        &self,
        queue: &mut mpsc::UnboundedReceiver<String>,
        sink: &mpsc::Sender<Bytes>,
    ) -> Result<(), ClientError> {
        loop {
            let message = select! {
                _ = sink.closed() => return Ok(()),
                _ = self.closed.cancelled() => return Ok(()),
                message = queue.recv() => match message {
                    Some(message) => message,
                    None => return Ok(()),
                },
            };

            // A reader that stopped consuming must not hold up a forced close.
            select! {
                _ = self.closed.cancelled() => return Ok(()),
                sent = sink.send(frame(&message)) => {
                    sent.map_err(|_| ClientError::StreamClosed)?;
                }
            }
        }
    }
}

impl Client for PushClient {
    fn id(&self) -> ClientId {
        self.id
    }

    fn kind(&self) -> ClientKind {
        ClientKind::Push
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

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::{sleep, timeout};

    use super::*;

    const WAIT: Duration = Duration::from_secs(1);

    /// The client registers asynchronously; retry until the hub reports a
    /// recipient.
    async fn broadcast_once_registered(hub: &Hub, message: &str) {
        timeout(WAIT, async {
            while hub.send(message).await.expect("hub running") == 0 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("client never registered");
    }

    #[test]
    fn frames_use_the_data_field() {
        assert_eq!(frame("42"), Bytes::from_static(b"data: 42\n\n"));
        assert_eq!(frame(""), Bytes::from_static(b"data: \n\n"));
    }

    #[tokio::test]
    async fn broadcast_is_written_as_one_frame() {
        let hub = Hub::new();
        hub.start().expect("start hub");

        let client = PushClient::new(hub.clone());
        let (sink, mut body) = mpsc::channel(BODY_BUFFER);
        let running = tokio::spawn(client.run(sink));

        broadcast_once_registered(&hub, "42").await;
        let chunk = timeout(WAIT, body.recv()).await.expect("frame in time");
        assert_eq!(chunk, Some(Bytes::from_static(b"data: 42\n\n")));

        // Dropping the body is what a disconnecting browser looks like.
        drop(body);
        timeout(WAIT, running)
            .await
            .expect("client should notice the disconnect")
            .expect("client task panicked")
            .expect("clean exit");

        assert_eq!(hub.send("after").await, Ok(0));
        hub.stop().await.expect("stop hub");
    }

    #[tokio::test]
    async fn hub_stop_ends_the_stream() {
        let hub = Hub::new();
        hub.start().expect("start hub");

        let client = PushClient::new(hub.clone());
        let (sink, mut body) = mpsc::channel(BODY_BUFFER);
        let running = tokio::spawn(client.clone().run(sink));
        broadcast_once_registered(&hub, "hi").await;
        let chunk = timeout(WAIT, body.recv()).await.expect("frame in time");
        assert_eq!(chunk, Some(frame("hi")));

        timeout(WAIT, hub.stop())
            .await
            .expect("stop should not hang")
            .expect("stop hub");
        timeout(WAIT, running)
            .await
            .expect("client should exit")
            .expect("client task panicked")
            .expect("clean exit");

        assert!(client.outbox.is_closed());
        assert_eq!(body.recv().await, None);
    }

    #[tokio::test]
    async fn stalled_reader_does_not_hold_up_stop() {
        let hub = Hub::new();
        hub.start().expect("start hub");

        let client = PushClient::new(hub.clone());
        // Room for one frame, and nobody reads the body.
        let (sink, body) = mpsc::channel(1);
        let running = tokio::spawn(client.clone().run(sink));

        broadcast_once_registered(&hub, "fills the buffer").await;
        assert_eq!(hub.send("waits for room").await, Ok(1));

        timeout(WAIT, hub.stop())
            .await
            .expect("stop should not wait on the reader")
            .expect("stop hub");
        timeout(WAIT, running)
            .await
            .expect("client should exit")
            .expect("client task panicked")
            .expect("clean exit");
        assert!(client.outbox.is_closed());
        drop(body);
    }

    #[tokio::test]
    async fn rejected_client_ends_immediately() {
        let hub = Hub::new();
        let client = PushClient::new(hub);
        let (sink, mut body) = mpsc::channel(BODY_BUFFER);

        client.clone().run(sink).await.expect("rejection is not an error");
        assert!(client.closed.is_cancelled());
        assert!(client.outbox.is_closed());
        assert_eq!(body.recv().await, None);
    }

    #[tokio::test]
    async fn running_twice_is_refused() {
        let client = PushClient::new(Hub::new());
        let (sink, _body) = mpsc::channel(BODY_BUFFER);
        client.clone().run(sink.clone()).await.expect("first run");
        assert!(matches!(
            client.run(sink).await,
            Err(ClientError::AlreadyRunning)
        ));
    }

    #[tokio::test]
    async fn response_carries_event_stream_headers() {
        let response = PushClient::new(Hub::new()).into_stream_response();
        let headers = response.headers();
        assert_eq!(headers[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(headers[header::CACHE_CONTROL], "no-cache");
        assert_eq!(headers[header::CONNECTION], "keep-alive");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(headers[header::ACCESS_CONTROL_EXPOSE_HEADERS], "Content-Type");
    }
}
