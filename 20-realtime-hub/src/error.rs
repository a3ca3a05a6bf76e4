use thiserror::Error;

use crate::hub::HubState;

/// Errors surfaced by the [`Hub`](crate::hub::Hub) to its immediate caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HubError {
    /// A lifecycle call was made while the hub was not in the required state.
    #[error("cannot move hub from {from} to {to}")]
    InvalidState { from: HubState, to: HubState },
    /// The event loop is not running, so the request has nowhere to go.
    #[error("hub is not running")]
    NotRunning,
}

/// Transport failures local to a single client connection.
///
/// These end the client's loops and trigger its cleanup. They are logged by
/// the adapter that drove the client and never reach the hub.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("websocket transport failed: {0}")]
    WebSocket(#[from] axum::Error),
    #[error("event stream closed while writing a frame")]
    StreamClosed,
    #[error("client is already running")]
    AlreadyRunning,
}
