//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Shutdown::trigger
//!
//! Shutdown (shutdown.rs):
//!     trigger → acceptor stops accepting → drain connections → cache released
//! ```
//!
//! # Design Decisions
//! - One broadcast channel fans the shutdown out to every subscriber
//! - Draining is bounded by `lifecycle.drain_timeout_secs`

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
