//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events via `tracing`)
//!     → metrics.rs (counters, gauges, histograms via `metrics`)
//!
//! Consumers:
//!     → stderr/stdout log output
//!     → Prometheus scrape endpoint (optional)
//! ```
//!
//! # Design Decisions
//! - Every connection runs in a span carrying its connection ID
//! - Metric calls are no-ops until an exporter is installed

pub mod logging;
pub mod metrics;
