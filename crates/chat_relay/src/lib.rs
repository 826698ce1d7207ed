//! # Chat Relay - Real-time WebSocket Chat Fan-out
//!
//! A WebSocket chat relay that lets many clients exchange messages and see
//! who is online. Every relay instance publishes what its clients say to a
//! shared broker topic and delivers everything it consumes from that topic to
//! all of its own sockets, so any number of instances can run side by side
//! behind a load balancer.
//!
//! ## Architecture Overview
//!
//! ### Core Components
//!
//! * **Connection Registry** - Open sessions and presence entries behind one lock
//! * **Frame Router** - Parses client frames, registers users, publishes chat
//! * **Broker Bridge** - Bounded-retry broker session with publish and consume paths
//! * **Presence Broadcaster** - Publishes a full membership snapshot on every change
//! * **Heartbeat Supervisor** - Ping/pong liveness; prunes silent connections
//!
//! ### Message Flow
//!
//! 1. Client sends `{"type":"user_join","user":"alice"}` to identify itself
//! 2. The registry records the user and a presence snapshot is published
//! 3. Client sends `{"text":"hello","user":"alice"}`
//! 4. The router stamps a server timestamp and publishes a chat frame
//! 5. Every instance consumes the frame and writes it to all of its open sockets,
//!    including the sender's
//!
//! ## Configuration
//!
//! The relay is configured through the [`RelayConfig`] struct:
//!
//! * **Network settings** - Bind address, WebSocket path, connection limits
//! * **Heartbeat** - Probe interval
//! * **Broker** - Backend, URL, topology names and retry policy
//!
//! ## Error Handling
//!
//! The relay uses structured error types to categorize failures:
//!
//! * [`RelayError`] - Network, broker and internal failures
//! * [`BrokerError`] - Failures at the broker seam
//! * [`FrameError`] - Frames that are not JSON objects
//!
//! Only an exhausted broker retry budget is fatal; everything else is
//! contained to one frame or one connection.
//!
//! ## Thread Safety
//!
//! All shared state lives in the registry behind a single `RwLock`. Each
//! socket has its own bounded writer queue, so one slow client never delays
//! delivery to the others.

// Re-export core types and functions for easy access
pub use broker::{
    AmqpBroker, BridgeState, Broker, BrokerBridge, BrokerDelivery, BrokerSession, MemoryBroker,
    Sleeper, TokioSleeper,
};
pub use config::{BrokerConfig, BrokerKind, RelayConfig};
pub use connection::{ConnectionId, ConnectionRegistry, PresenceEntry};
pub use error::{BrokerError, FrameError, RelayError};
pub use messaging::{ChatFrame, ClientFrame, PresenceSnapshot, PresenceUser, RelayFrame};
pub use server::{RelayServer, RelayStats};
pub use shutdown::ShutdownState;
pub use utils::{create_relay, create_relay_with_config};

// Public module declarations
pub mod broker;
pub mod config;
pub mod connection;
pub mod error;
pub mod health;
pub mod heartbeat;
pub mod messaging;
pub mod presence;
pub mod server;
pub mod shutdown;
pub mod utils;

// End-to-end tests against a live listener
#[cfg(test)]
mod tests;
