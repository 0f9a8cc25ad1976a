//! Trace events and the sinks that render them.
//!
//! Every diagnostic the observer produces is a [`TraceEvent`] paired with the
//! [`Tag`] of the stream it came from. Sinks are best-effort: emitting never
//! fails and never feeds back into the observed data.

use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;

use crate::pktline::LENGTH_PREFIX;
use crate::tag::Tag;

/// Tracing target used for all transport trace lines.
pub const TRACE_TARGET: &str = "pktscope::transport";

/// A single diagnostic produced while observing a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    /// A request is about to be handed to the transport.
    RequestSent {
        /// Request URI.
        uri: String,
        /// Rendered request line and headers, if header dumping is enabled.
        head: Option<String>,
    },
    /// The transport returned a response.
    ResponseReceived {
        /// HTTP status code.
        status: u16,
        /// Request URI.
        uri: String,
        /// Rendered status line and headers, if header dumping is enabled.
        head: Option<String>,
    },
    /// The transport failed; the error is passed on to the caller.
    TransportError {
        /// Rendered error.
        message: String,
    },
    /// A complete pkt-line that was not routed to a sideband.
    Frame {
        /// Total frame length, prefix included.
        size: usize,
        /// Frame payload.
        payload: Bytes,
    },
    /// A `0000` flush packet.
    FlushPacket,
    /// The `PACK` signature; framing ends here.
    PackMarker,
    /// A length field that is not a valid pkt-line length.
    InvalidSize {
        /// The offending length field.
        field: [u8; LENGTH_PREFIX],
    },
    /// The stream closed with a partial pkt-line buffered.
    IncompleteFrame {
        /// Buffered byte count.
        bytes: usize,
    },
    /// The stream closed after bytes that were never decoded.
    TrailingBytes {
        /// Bytes seen after `PACK` or after a framing error.
        bytes: usize,
    },
}

/// How loudly an event should be reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Normal protocol traffic.
    Debug,
    /// Framing anomalies.
    Warn,
    /// Transport failures.
    Error,
}

impl TraceEvent {
    /// Severity used when the event is logged.
    pub fn severity(&self) -> Severity {
        match self {
            Self::TransportError { .. } => Severity::Error,
            Self::InvalidSize { .. } | Self::IncompleteFrame { .. } | Self::TrailingBytes { .. } => {
                Severity::Warn
            }
            _ => Severity::Debug,
        }
    }

    /// Renders the event, truncating frame payloads to `preview` bytes.
    pub fn render(&self, preview: Option<usize>) -> String {
        match self {
            Self::Frame { size, payload } => {
                let shown = match preview {
                    Some(limit) if payload.len() > limit => &payload[..limit],
                    _ => &payload[..],
                };
                let mut line = format!("{:04X}: \"{}\"", size, shown.escape_ascii());
                if shown.len() < payload.len() {
                    line.push_str(&format!(" (+{} bytes)", payload.len() - shown.len()));
                }
                line
            }
            other => other.to_string(),
        }
    }
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RequestSent { uri, head } => {
                write!(f, "sending request to {uri}")?;
                if let Some(head) = head {
                    write!(f, "\n{head}")?;
                }
                Ok(())
            }
            Self::ResponseReceived { status, uri, head } => {
                write!(f, "received {status} response from {uri}")?;
                if let Some(head) = head {
                    write!(f, "\n{head}")?;
                }
                Ok(())
            }
            Self::TransportError { message } => write!(f, "error: {message}"),
            Self::Frame { .. } => f.write_str(&self.render(None)),
            Self::FlushPacket => f.write_str("flush packet"),
            Self::PackMarker => f.write_str("PACK"),
            Self::InvalidSize { field } => {
                write!(f, "invalid packet size: {}", String::from_utf8_lossy(field))
            }
            Self::IncompleteFrame { bytes } => write!(f, "{bytes} bytes of incomplete pktline"),
            Self::TrailingBytes { bytes } => {
                write!(f, "{bytes} unprocessed bytes after PACK or error")
            }
        }
    }
}

/// Destination for trace events.
pub trait TraceSink: Send + Sync {
    /// Records one event. Must not fail and must not block on other requests.
    fn emit(&self, tag: &Tag, event: &TraceEvent);
}

/// Sink that writes each event as a `tracing` record.
#[derive(Debug, Clone, Default)]
pub struct TracingSink {
    payload_preview: Option<usize>,
}

impl TracingSink {
    /// Creates a sink that logs full payloads.
    pub fn new() -> Self {
        Self::default()
    }

    /// Limits how many payload bytes are rendered per frame.
    pub fn with_payload_preview(mut self, limit: Option<usize>) -> Self {
        self.payload_preview = limit;
        self
    }
}

impl TraceSink for TracingSink {
    fn emit(&self, tag: &Tag, event: &TraceEvent) {
        let message = event.render(self.payload_preview);
        match event.severity() {
            Severity::Debug => {
                tracing::debug!(target: TRACE_TARGET, tag = %tag, "[http transport/{tag}] {message}")
            }
            Severity::Warn => {
                tracing::warn!(target: TRACE_TARGET, tag = %tag, "[http transport/{tag}] {message}")
            }
            Severity::Error => {
                tracing::error!(target: TRACE_TARGET, tag = %tag, "[http transport/{tag}] {message}")
            }
        }
    }
}

/// Sink that keeps every event in memory, in emission order.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<(Tag, TraceEvent)>>,
}

impl MemorySink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of all recorded events.
    pub fn events(&self) -> Vec<(Tag, TraceEvent)> {
        self.events.lock().clone()
    }

    /// Returns all recorded events rendered as `[tag] message`.
    pub fn lines(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .map(|(tag, event)| format!("[{tag}] {event}"))
            .collect()
    }

    /// Returns the events recorded under exactly `tag`.
    pub fn events_for(&self, tag: &str) -> Vec<TraceEvent> {
        self.events
            .lock()
            .iter()
            .filter(|(t, _)| t.as_str() == tag)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Number of recorded events.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Returns true if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl TraceSink for MemorySink {
    fn emit(&self, tag: &Tag, event: &TraceEvent) {
        self.events.lock().push((tag.clone(), event.clone()));
    }
}
