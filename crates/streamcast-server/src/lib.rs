//! Streamcast server: the control plane of a federated
//! activity-broadcast mesh.
//!
//! Each process accepts client connections, joins a mesh of peer
//! servers over an authenticated link, and converges usernames,
//! activity history, and load information across the mesh by gossip.
//! All protocol state lives in a single [`coordinator::Coordinator`]
//! actor; connections feed it decoded lines over a channel, so no
//! handler ever touches shared state outside the actor task.

pub mod config;
pub mod connection;
pub mod coordinator;
pub mod directory;
pub mod server;

pub use config::ServerConfig;
pub use server::{run, spawn, ServerHandle};
