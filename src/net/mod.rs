//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (bind once, accept loop)
//!     → connection.rs (connection ID, peer confirmation, live tracking)
//!         → resolver.rs (reverse DNS for the peer, bounded)
//!     → hand off to the request handler
//! ```
//!
//! # Design Decisions
//! - Binding is the only fatal network failure; accept errors are logged
//! - Accepting never waits on handlers
//! - Each connection tracked with a drop guard for graceful shutdown

pub mod connection;
pub mod listener;
pub mod resolver;

pub use connection::{ConnectionContext, ConnectionGuard, ConnectionId, ConnectionTracker};
pub use listener::{Listener, ListenerError};
pub use resolver::PeerResolver;
