//! HTTP front end.
//!
//! Serves a small demo page, accepts broadcasts on `POST /send` and hands
//! `/ws` and `/sse` connections to their transport clients. Shutdown stops the
//! hub before the listener is released.

use std::{future::Future, net::SocketAddr};

use anyhow::Result;
use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    http::StatusCode,
    response::{Html, Response},
    routing::{get, post},
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::{duplex::DuplexClient, hub::Hub, push::PushClient};

const INDEX_PAGE: &str = include_str!("../static/index.html");

/// Routes for the index page, the submit endpoint and both transports.
pub fn router(hub: Hub) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/send", post(submit))
        .route("/ws", get(websocket))
        .route("/sse", get(server_sent_events))
        .layer(TraceLayer::new_for_http())
        .with_state(hub)
}

async fn index() -> Html<&'static str> {
    Html(INDEX_PAGE)
}

/// Broadcasts the raw request body. Bodies that are not valid UTF-8 are
/// rejected with `400` by the `String` extractor.
async fn submit(State(hub): State<Hub>, body: String) -> StatusCode {
    match hub.send(body).await {
        Ok(recipients) => {
            debug!(recipients, "message submitted");
            StatusCode::OK
        }
        Err(err) => {
            warn!(error = %err, "cannot broadcast submitted message");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

async fn websocket(State(hub): State<Hub>, upgrade: WebSocketUpgrade) -> Response {
    upgrade
        .on_failed_upgrade(|err| warn!(error = %err, "websocket upgrade failed"))
        .on_upgrade(move |socket| async move {
            if let Err(err) = DuplexClient::new(hub).run(socket).await {
                warn!(error = %err, "websocket client ended with error");
            }
        })
}

async fn server_sent_events(State(hub): State<Hub>) -> Response {
    PushClient::new(hub).into_stream_response()
}

/// HTTP front end bound to a listener, driving one [`Hub`].
pub struct Server {
    listener: TcpListener,
    hub: Hub,
}

impl Server {
    pub fn new(listener: TcpListener, hub: Hub) -> Self {
        Self { listener, hub }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Starts the hub and serves until `shutdown` resolves.
    ///
    /// On shutdown the hub is stopped first, which closes every WebSocket and
    /// SSE client; the listener keeps accepting (and new clients are turned
    /// away) until that drain finishes.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Server { listener, hub } = self;
        hub.start()?;

        let app = router(hub.clone());
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.await;
                info!("shutdown requested");
                if let Err(err) = hub.stop().await {
                    warn!(error = %err, "failed to stop hub");
                }
            })
            .await?;

        info!("server stopped");
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{Method, Request},
    };
    use tower::ServiceExt;

    use super::*;

    fn request(method: Method, uri: &str, body: impl Into<Body>) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(body.into())
            .expect("valid request")
    }

    #[tokio::test]
    async fn submit_broadcasts_with_no_listeners() {
        let hub = Hub::new();
        hub.start().expect("start hub");

        let response = router(hub.clone())
            .oneshot(request(Method::POST, "/send", "hello"))
            .await
            .expect("infallible");
        assert_eq!(response.status(), StatusCode::OK);

        hub.stop().await.expect("stop hub");
    }

    #[tokio::test]
    async fn submit_requires_post() {
        let response = router(Hub::new())
            .oneshot(request(Method::GET, "/send", Body::empty()))
            .await
            .expect("infallible");
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn submit_rejects_non_utf8_bodies() {
        let hub = Hub::new();
        hub.start().expect("start hub");

        let response = router(hub.clone())
            .oneshot(request(Method::POST, "/send", vec![0xff, 0xfe, 0xfd]))
            .await
            .expect("infallible");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        hub.stop().await.expect("stop hub");
    }

    #[tokio::test]
    async fn submit_to_stopped_hub_is_unavailable() {
        let response = router(Hub::new())
            .oneshot(request(Method::POST, "/send", "nobody home"))
            .await
            .expect("infallible");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn index_serves_html() {
        let response = router(Hub::new())
            .oneshot(request(Method::GET, "/", Body::empty()))
            .await
            .expect("infallible");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(
            response.headers()[axum::http::header::CONTENT_TYPE]
                .to_str()
                .expect("ascii header")
                .starts_with("text/html")
        );
    }
}
