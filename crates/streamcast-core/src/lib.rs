//! Core types for Streamcast.
//!
//! This crate provides the protocol primitives shared by the server and
//! client: the wire message set, the line codec, and the mergeable user
//! directory / activity log that gossip converges across the mesh.

mod message;
mod state;

pub use message::{decode, Activity, DecodeError, Message};
pub use state::{activity_key, ActivityLog, UserDirectory};

/// The reserved username that bypasses secret verification and cannot
/// be registered.
pub const ANONYMOUS_USERNAME: &str = "anonymous";

/// Diagnostic strings that carry protocol meaning on the wire: a peer
/// receiving an INVALID_MESSAGE with one of these drops the connection.
pub mod info {
    pub const UNAUTHENTICATED_SERVER: &str = "unauthenticated server";
    pub const REPEATED_AUTHENTICATION: &str = "repeated authentication";
}
