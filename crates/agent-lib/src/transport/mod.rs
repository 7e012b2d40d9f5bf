//! Real-time transport to the backend
//!
//! One logical connection per agent. The [`TransportClient`] reconnects with
//! exponential backoff, replays unsent messages after every reconnect and
//! hands inbound control messages to a registered handler.

mod client;
mod state;
mod websocket;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{ConnectionHandle, Credentials, TransportClient, TransportStatus};
pub use state::{ConnectionMachine, ConnectionState, Failure, ReconnectPolicy, StateChange};
pub use websocket::{parse_channel_uri, Connector, Frame, Link, WsConnector};
