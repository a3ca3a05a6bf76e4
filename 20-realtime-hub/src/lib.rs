//! Real-time broadcast hub serving WebSocket and Server-Sent Events clients.
//!
//! Every message posted to `/send`, and every text frame received from a
//! WebSocket client, is fanned out to all connected clients.
//!
//! - [`hub`] owns the set of connected clients inside a single event loop
//!   task and handles start, draining stop, registration and broadcast.
//! - [`client`] defines the [`client::Client`] capability the hub relies on
//!   and the closable per-client outbound queue.
//! - [`duplex`] runs WebSocket clients (read and write loops over one socket).
//! - [`push`] runs SSE clients, writing `data: <message>` frames.
//! - [`server`] wires the transports into an axum router and drives graceful
//!   shutdown.
//! - [`cli`] parses the command-line interface.
//!
//! Unit tests sit next to the code; `tests/` drives the real server over
//! TCP.

pub mod cli;
pub mod client;
pub mod duplex;
pub mod error;
pub mod hub;
pub mod push;
pub mod server;

pub use error::{ClientError, HubError};
pub use hub::{Hub, HubState};
