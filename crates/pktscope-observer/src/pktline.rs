//! Git pkt-line framing primitives.
//!
//! The pkt-line format is used for all git smart-HTTP communication.
//! Each line is prefixed with a 4-character hex length that counts itself,
//! or "0000" for flush. Once a stream reaches "PACK" the remaining bytes
//! are raw pack data and no longer framed.

/// Length of the hex length prefix.
pub const LENGTH_PREFIX: usize = 4;

/// Length field of a flush packet.
pub const FLUSH: [u8; LENGTH_PREFIX] = *b"0000";

/// Signature that starts unframed pack data.
pub const PACK_SIGNATURE: [u8; LENGTH_PREFIX] = *b"PACK";

/// Sideband channel carrying pack data.
pub const SIDEBAND_DATA: u8 = 1;

/// Sideband channel carrying progress messages.
pub const SIDEBAND_PROGRESS: u8 = 2;

/// How the first four bytes of a frame are to be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthField {
    /// Flush packet (0000).
    Flush,
    /// Start of raw pack data.
    Pack,
    /// Total frame length, prefix included. Always at least 4.
    Size(usize),
    /// Not four hex digits, or a length shorter than the prefix.
    Invalid,
}

impl LengthField {
    /// Classifies a 4-byte length field.
    pub fn parse(field: [u8; LENGTH_PREFIX]) -> Self {
        if field == FLUSH {
            return Self::Flush;
        }
        if field == PACK_SIGNATURE {
            return Self::Pack;
        }

        let mut size = 0usize;
        for byte in field {
            let digit = match (byte as char).to_digit(16) {
                Some(d) => d as usize,
                None => return Self::Invalid,
            };
            size = size * 16 + digit;
        }

        if size < LENGTH_PREFIX {
            Self::Invalid
        } else {
            Self::Size(size)
        }
    }
}

/// A pkt-line packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLine {
    /// Data line with content.
    Data(Vec<u8>),
    /// Flush packet (0000).
    Flush,
}

impl PktLine {
    /// Creates a data packet from a string slice.
    pub fn from_string(s: &str) -> Self {
        Self::Data(s.as_bytes().to_vec())
    }

    /// Creates a data packet from bytes.
    pub fn from_bytes(b: impl Into<Vec<u8>>) -> Self {
        Self::Data(b.into())
    }

    /// Creates a data packet multiplexed onto a sideband channel.
    pub fn sideband(channel: u8, data: &[u8]) -> Self {
        let mut payload = Vec::with_capacity(data.len() + 1);
        payload.push(channel);
        payload.extend_from_slice(data);
        Self::Data(payload)
    }

    /// Encodes the packet to bytes.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Data(data) => {
                let len = data.len() + LENGTH_PREFIX;
                let mut result = format!("{:04x}", len).into_bytes();
                result.extend_from_slice(data);
                result
            }
            Self::Flush => FLUSH.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pktline_encode() {
        assert_eq!(PktLine::from_string("hello\n").encode(), b"000ahello\n");
        assert_eq!(PktLine::Flush.encode(), b"0000");
    }

    #[test]
    fn test_pktline_empty_data() {
        let pkt = PktLine::from_bytes(Vec::new());
        assert_eq!(pkt.encode(), b"0004");
    }

    #[test]
    fn test_pktline_sideband() {
        let pkt = PktLine::sideband(SIDEBAND_PROGRESS, b"Counting objects\r");
        let encoded = pkt.encode();
        assert_eq!(&encoded[..4], b"0016");
        assert_eq!(encoded[4], 2);
        assert!(encoded.ends_with(b"objects\r"));
    }

    #[test]
    fn test_length_field_sentinels() {
        assert_eq!(LengthField::parse(*b"0000"), LengthField::Flush);
        assert_eq!(LengthField::parse(*b"PACK"), LengthField::Pack);
    }

    #[test]
    fn test_length_field_sizes() {
        assert_eq!(LengthField::parse(*b"0004"), LengthField::Size(4));
        assert_eq!(LengthField::parse(*b"000a"), LengthField::Size(10));
        assert_eq!(LengthField::parse(*b"00FF"), LengthField::Size(255));
        assert_eq!(LengthField::parse(*b"ffff"), LengthField::Size(65535));
    }

    #[test]
    fn test_length_field_too_short() {
        assert_eq!(LengthField::parse(*b"0001"), LengthField::Invalid);
        assert_eq!(LengthField::parse(*b"0003"), LengthField::Invalid);
    }

    #[test]
    fn test_length_field_not_hex() {
        assert_eq!(LengthField::parse(*b"zzzz"), LengthField::Invalid);
        assert_eq!(LengthField::parse(*b"+00a"), LengthField::Invalid);
        assert_eq!(LengthField::parse(*b"-001"), LengthField::Invalid);
        assert_eq!(LengthField::parse([0xff, 0, 0, 0]), LengthField::Invalid);
    }
}
