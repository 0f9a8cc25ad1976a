//! Observer error types.

use thiserror::Error;

/// Errors raised while setting up observation.
///
/// Decoding itself never fails; malformed traffic is reported through the
/// trace instead.
#[derive(Debug, Error)]
pub enum ObserverError {
    /// A configured header name is not a valid HTTP header name.
    #[error("invalid header name: {0}")]
    InvalidHeaderName(String),
}
