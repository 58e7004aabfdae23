//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! accepted TCP connection
//!     → server.rs (acceptor, one task per connection)
//!     → handler.rs (per-connection state machine)
//!         → parser.rs (request line and headers)
//!         → cache probe
//!         → forwarder.rs (rewrite, send, stream origin response)
//!         → response.rs (error pages)
//!     → bytes back to the client
//! ```

pub mod forwarder;
pub mod handler;
pub mod parser;
pub mod response;
pub mod server;

pub use handler::{Outcome, RequestHandler};
pub use server::ProxyServer;
