//! Passive pkt-line observer for smart-HTTP git transports.
//!
//! This crate sits inside an HTTP client's transport stack and decodes the
//! git pkt-line framing of request and response bodies as they stream past,
//! without touching the bytes. Sideband channels are demultiplexed and each
//! decoded frame is reported as a tagged trace line.
//!
//! ```rust,no_run
//! use pktscope_observer::{ObserveLayer, ObserverConfig, ReqwestTransport};
//! use tower::ServiceBuilder;
//!
//! # fn main() -> pktscope_observer::Result<()> {
//! let config = ObserverConfig::default();
//! let transport = ServiceBuilder::new()
//!     .layer(ObserveLayer::from_config(&config)?)
//!     .service(ReqwestTransport::default());
//! # let _ = transport;
//! # Ok(())
//! # }
//! ```

mod accumulator;
mod body;
mod client;
mod config;
mod error;
pub mod pktline;
mod request_id;
mod sink;
mod tag;
mod transport;

pub use accumulator::{FrameAccumulator, MAX_SIDEBAND_DEPTH};
pub use body::{ObservedBody, ObservingReader};
pub use client::{BoxError, ReqwestTransport};
pub use config::{ObserverConfig, DEFAULT_REQUEST_ID_HEADER};
pub use error::ObserverError;
pub use pktline::{LengthField, PktLine};
pub use request_id::{summarize, RequestIdLayer, RequestIdService, SUMMARY_TARGET};
pub use sink::{MemorySink, Severity, TraceEvent, TraceSink, TracingSink, TRACE_TARGET};
pub use tag::{RequestCounter, Tag};
pub use transport::{HeadRenderer, Observe, ObserveLayer};

/// Result type for observer setup.
pub type Result<T> = std::result::Result<T, ObserverError>;
