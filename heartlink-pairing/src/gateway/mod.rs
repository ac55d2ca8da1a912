//! Realtime channel between the two participants of a session.

pub mod compression;
pub mod connection;
pub mod envelope;
pub mod registry;
pub mod socket;

pub use connection::{CloseReason, Connection, ConnectionState, Gateway, GatewaySettings, Inbound};
pub use envelope::{ClientFrame, MessageView, ServerEvent};
pub use registry::ConnectionRegistry;
