//! Correlation tags for grouping trace lines.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifies which request, body or sideband channel produced a trace line.
///
/// A request gets a numeric root tag; its sub-streams extend it with a
/// path-like suffix, e.g. `7/response/sideband-2`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tag(String);

impl Tag {
    /// Creates a tag from an arbitrary label.
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    /// Tag for the request body of this request.
    pub fn request(&self) -> Self {
        self.join("request")
    }

    /// Tag for the response body of this request.
    pub fn response(&self) -> Self {
        self.join("response")
    }

    /// Tag for a sideband channel carried inside this stream.
    pub fn sideband(&self, channel: u8) -> Self {
        self.join(&format!("sideband-{channel}"))
    }

    fn join(&self, suffix: &str) -> Self {
        Self(format!("{}/{}", self.0, suffix))
    }

    /// Returns the tag as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Tag {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Hands out root tags for observed requests.
///
/// The counter is the only state shared between in-flight requests.
#[derive(Debug, Default)]
pub struct RequestCounter {
    count: AtomicU64,
}

impl RequestCounter {
    /// Creates a counter whose first tag is `1`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the next request tag.
    pub fn next_tag(&self) -> Tag {
        let n = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        Tag(n.to_string())
    }

    /// Number of tags handed out so far.
    pub fn issued(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}
