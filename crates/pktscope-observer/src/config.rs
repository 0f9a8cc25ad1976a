//! Observer configuration types.

use http::HeaderName;
use serde::{Deserialize, Serialize};

use crate::{ObserverError, Result};

/// Header carrying the upstream request id on GitHub responses.
pub const DEFAULT_REQUEST_ID_HEADER: &str = "x-github-request-id";

/// Configuration for transport observation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ObserverConfig {
    /// Log request and response heads.
    pub dump_headers: bool,
    /// Headers whose values are replaced with `<redacted>` in the trace.
    pub redact_headers: Vec<String>,
    /// Maximum payload bytes rendered per frame. `None` renders everything.
    pub payload_preview: Option<usize>,
    /// Response header reported by the request-id summary line.
    pub request_id_header: Option<String>,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            dump_headers: true,
            redact_headers: vec![
                "authorization".to_string(),
                "proxy-authorization".to_string(),
                "cookie".to_string(),
            ],
            payload_preview: None,
            request_id_header: Some(DEFAULT_REQUEST_ID_HEADER.to_string()),
        }
    }
}

impl ObserverConfig {
    /// Checks that every configured header name is valid.
    pub fn validate(&self) -> Result<()> {
        self.redacted_header_names()?;
        self.request_id_header_name()?;
        Ok(())
    }

    /// Parsed names of the redacted headers.
    pub fn redacted_header_names(&self) -> Result<Vec<HeaderName>> {
        self.redact_headers.iter().map(|h| parse_header(h)).collect()
    }

    /// Parsed name of the request-id header, if one is configured.
    pub fn request_id_header_name(&self) -> Result<Option<HeaderName>> {
        self.request_id_header.as_deref().map(parse_header).transpose()
    }
}

fn parse_header(name: &str) -> Result<HeaderName> {
    HeaderName::from_bytes(name.trim().as_bytes())
        .map_err(|_| ObserverError::InvalidHeaderName(name.to_string()))
}
