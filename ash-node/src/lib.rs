//! Ash Node
//!
//! Peer-to-peer replication of signed updates over WebSocket.
//!
//! # Architecture
//!
//! - **Sessions**: one task per connection, challenge/response handshake
//! - **Replication Core**: a single actor orders every ledger decision
//! - **Catch-up**: gaps are filled by ranged requests to the sender
//! - **Fan-out**: accepted updates go to every other Active session
//!
//! # Invariants
//!
//! - Nothing reaches the ledger without a valid signature
//! - A slow peer only ever closes its own session
//! - Updates from one session are processed in arrival order

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod codec;
pub mod config;
pub mod error;
pub mod node;
pub mod replication;
pub mod session;

// Re-exports
pub use codec::{CatchUpRange, Envelope, EnvelopeKind};
pub use config::{NodeConfig, ReconnectConfig};
pub use error::{DecodeError, HandshakeError, NodeError, Result, SessionError};
pub use node::Node;
pub use replication::{
    spawn_replication_actor, Decision, NodeStatus, RejectReason, ReplicationConfig,
    ReplicationHandle,
};
pub use session::{
    run_session, CloseReason, PeerIdentity, SessionContext, SessionId, SessionLimits,
    SessionManager, SessionOutcome, SessionState,
};
