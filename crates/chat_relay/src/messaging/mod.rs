//! Frame parsing and routing for client-relay communication.
//!
//! This module provides the wire frames exchanged with clients and the
//! broker, and the router that turns inbound client frames into registry
//! updates and broker publishes.

pub mod router;
pub mod types;

pub use router::{FrameRouter, RouteOutcome};
pub use types::{
    preview, ChatFrame, ClientFrame, PresenceSnapshot, PresenceUser, RelayFrame, ANONYMOUS_USER,
};
