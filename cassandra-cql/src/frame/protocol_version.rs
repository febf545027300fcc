//! Negotiated native protocol version and the per-version wire facts.

use super::TryFromPrimitiveError;
use std::fmt::Display;

/// A native protocol version understood by this crate.
///
/// Every version-dependent decision (header layout, collection length width,
/// unset values, message layouts) is made by matching on this enum, so adding
/// a version forces every such site to be revisited.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ProtocolVersion {
    V1 = 1,
    V3 = 3,
    V4 = 4,
}

impl ProtocolVersion {
    /// The newest version this crate speaks.
    pub const LATEST: ProtocolVersion = ProtocolVersion::V4;

    /// The oldest version, where downgrading stops.
    pub const FLOOR: ProtocolVersion = ProtocolVersion::V1;

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Version one step below this one, if any.
    pub fn lower(self) -> Option<ProtocolVersion> {
        match self {
            ProtocolVersion::V4 => Some(ProtocolVersion::V3),
            ProtocolVersion::V3 => Some(ProtocolVersion::V1),
            ProtocolVersion::V1 => None,
        }
    }

    /// Size of a frame header in bytes.
    pub fn header_len(self) -> usize {
        header_len_for_version_byte(self.as_byte())
    }

    /// Number of usable stream ids per connection (non-negative ids only,
    /// negative ids are reserved for server-pushed events).
    pub fn max_stream_ids(self) -> usize {
        match self {
            ProtocolVersion::V1 => 128,
            ProtocolVersion::V3 | ProtocolVersion::V4 => 32768,
        }
    }

    /// Whether collection element counts and element sizes are 4-byte ints
    /// (as opposed to 2-byte shorts).
    pub fn has_int_collection_lengths(self) -> bool {
        self >= ProtocolVersion::V3
    }

    /// Whether a bound value can be marked as "not set" (length -2).
    pub fn supports_unset(self) -> bool {
        self >= ProtocolVersion::V4
    }

    /// BATCH, paging, serial consistency and default timestamps.
    pub fn supports_query_flags(self) -> bool {
        self >= ProtocolVersion::V3
    }

    /// Tuples and user-defined types.
    pub fn supports_nested_types(self) -> bool {
        self >= ProtocolVersion::V3
    }

    /// tinyint, smallint, date, time and duration column kinds.
    pub fn supports_v4_scalars(self) -> bool {
        self >= ProtocolVersion::V4
    }

    /// Custom payloads and warnings in frames.
    pub fn supports_frame_extensions(self) -> bool {
        self >= ProtocolVersion::V4
    }

    /// SASL style authentication (AUTH_RESPONSE) instead of CREDENTIALS.
    pub fn supports_sasl_auth(self) -> bool {
        self >= ProtocolVersion::V3
    }
}

/// Header size for any version byte, including versions this crate does not
/// speak. Servers answer unsupported versions with an error frame laid out in
/// their own (older) format, which must still be framed correctly.
pub fn header_len_for_version_byte(version: u8) -> usize {
    if version & 0x7f < 3 {
        8
    } else {
        9
    }
}

impl TryFrom<u8> for ProtocolVersion {
    type Error = TryFromPrimitiveError<u8>;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value & 0x7f {
            1 => Ok(ProtocolVersion::V1),
            3 => Ok(ProtocolVersion::V3),
            4 => Ok(ProtocolVersion::V4),
            _ => Err(TryFromPrimitiveError {
                enum_name: "ProtocolVersion",
                primitive: value,
            }),
        }
    }
}

impl Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.as_byte())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downgrade_chain_ends_at_floor() {
        let mut version = ProtocolVersion::LATEST;
        let mut seen = vec![version];
        while let Some(lower) = version.lower() {
            version = lower;
            seen.push(version);
        }
        assert_eq!(
            seen,
            vec![ProtocolVersion::V4, ProtocolVersion::V3, ProtocolVersion::V1]
        );
        assert_eq!(version, ProtocolVersion::FLOOR);
    }

    #[test]
    fn header_sizes() {
        assert_eq!(ProtocolVersion::V1.header_len(), 8);
        assert_eq!(ProtocolVersion::V3.header_len(), 9);
        assert_eq!(ProtocolVersion::V4.header_len(), 9);
        // Response version byte of a v2 server.
        assert_eq!(header_len_for_version_byte(0x82), 8);
    }

    #[test]
    fn from_response_byte() {
        assert_eq!(ProtocolVersion::try_from(0x84).unwrap(), ProtocolVersion::V4);
        assert_eq!(ProtocolVersion::try_from(0x03).unwrap(), ProtocolVersion::V3);
        assert!(ProtocolVersion::try_from(0x02).is_err());
        assert!(ProtocolVersion::try_from(0x05).is_err());
    }
}
