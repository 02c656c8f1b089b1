//! WAL segment names and log sequence numbers
//!
//! A segment name is a fixed-width hexadecimal string encoding three 32-bit
//! components:
//!
//! ```text
//! TTTTTTTT LLLLLLLL SSSSSSSS
//! timeline log-file segment
//! ```
//!
//! The segment component counts segments within one log file and wraps at
//! [`SEGMENTS_PER_LOG`], carrying into the log-file component. Names sort
//! lexicographically in archive order, which is why the width is fixed.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Length of a segment name in hex characters (three 8-digit components).
pub const SEGMENT_NAME_LEN: usize = 24;

/// Number of segments in one log file; the segment component wraps here.
pub const SEGMENTS_PER_LOG: u32 = 0x100;

/// Highest valid segment component within one log file.
const MAX_SEGMENT_NO: u32 = SEGMENTS_PER_LOG - 1;

/// Errors for malformed segment names and LSN text.
///
/// These are always surfaced to the caller and never retried: a malformed
/// name indicates a caller bug or on-disk corruption, not a transient
/// condition.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FormatError {
    /// Input is not exactly [`SEGMENT_NAME_LEN`] characters.
    #[error("segment name must be {SEGMENT_NAME_LEN} hex characters, got {0:?}")]
    BadLength(String),

    /// Input contains a character outside `[0-9A-Fa-f]`.
    #[error("segment name contains non-hex characters: {0:?}")]
    NotHex(String),

    /// Segment component exceeds the per-log maximum.
    #[error("segment number {0:#X} exceeds the per-log maximum {MAX_SEGMENT_NO:#X}")]
    SegmentOutOfRange(u32),

    /// The log-file component is already at its ceiling.
    #[error("cannot increment past log file 0xFFFFFFFF")]
    LogOverflow,

    /// LSN text is not of the form `<hex>/<hex>`.
    #[error("LSN must be of the form <hex>/<hex>, got {0:?}")]
    BadLsn(String),
}

/// An immutable WAL segment name.
///
/// Constructed by parsing the 24-character textual form or by deriving the
/// successor of another name via [`SegmentName::next`]. Ordering follows
/// archive order (timeline, then log file, then segment).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentName {
    timeline: u32,
    log: u32,
    segment: u32,
}

impl SegmentName {
    /// Build a name from raw components.
    ///
    /// Fails if the segment component is outside the per-log range.
    pub fn new(timeline: u32, log: u32, segment: u32) -> Result<Self, FormatError> {
        if segment > MAX_SEGMENT_NO {
            return Err(FormatError::SegmentOutOfRange(segment));
        }
        Ok(SegmentName {
            timeline,
            log,
            segment,
        })
    }

    /// Timeline component.
    pub fn timeline(&self) -> u32 {
        self.timeline
    }

    /// Log-file component.
    pub fn log(&self) -> u32 {
        self.log
    }

    /// Segment component within the log file.
    pub fn segment(&self) -> u32 {
        self.segment
    }

    /// The next segment name in archive order.
    ///
    /// The segment component wraps at the per-log maximum and carries into
    /// the log-file component. Incrementing the final segment of log file
    /// `0xFFFFFFFF` fails with [`FormatError::LogOverflow`].
    pub fn next(&self) -> Result<Self, FormatError> {
        if self.segment < MAX_SEGMENT_NO {
            return Ok(SegmentName {
                segment: self.segment + 1,
                ..*self
            });
        }
        let log = self.log.checked_add(1).ok_or(FormatError::LogOverflow)?;
        Ok(SegmentName {
            timeline: self.timeline,
            log,
            segment: 0,
        })
    }
}

impl FromStr for SegmentName {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, FormatError> {
        if s.len() != SEGMENT_NAME_LEN {
            return Err(FormatError::BadLength(s.to_string()));
        }
        if !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(FormatError::NotHex(s.to_string()));
        }
        let timeline = u32::from_str_radix(&s[0..8], 16).map_err(|_| FormatError::NotHex(s.to_string()))?;
        let log = u32::from_str_radix(&s[8..16], 16).map_err(|_| FormatError::NotHex(s.to_string()))?;
        let segment = u32::from_str_radix(&s[16..24], 16).map_err(|_| FormatError::NotHex(s.to_string()))?;
        SegmentName::new(timeline, log, segment)
    }
}

impl fmt::Display for SegmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08X}{:08X}{:08X}",
            self.timeline, self.log, self.segment
        )
    }
}

/// A log sequence number: a monotonically increasing 64-bit log position.
///
/// Parsed from the textual `<hex>/<hex>` form where the first half is the
/// high 32 bits and the second the low 32 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(
    /// Raw 64-bit log position.
    pub u64,
);

impl Lsn {
    /// The raw 64-bit position.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl FromStr for Lsn {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, FormatError> {
        let (high, low) = s
            .split_once('/')
            .ok_or_else(|| FormatError::BadLsn(s.to_string()))?;
        let high = u32::from_str_radix(high, 16).map_err(|_| FormatError::BadLsn(s.to_string()))?;
        let low = u32::from_str_radix(low, 16).map_err(|_| FormatError::BadLsn(s.to_string()))?;
        Ok(Lsn((u64::from(high) << 32) | u64::from(low)))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_and_render_roundtrip() {
        let name: SegmentName = "000000010000000000000051".parse().unwrap();
        assert_eq!(name.timeline(), 1);
        assert_eq!(name.log(), 0);
        assert_eq!(name.segment(), 0x51);
        assert_eq!(name.to_string(), "000000010000000000000051");
    }

    #[test]
    fn test_lowercase_input_renders_canonical() {
        let name: SegmentName = "000000010000000000000a5f".parse().unwrap();
        assert_eq!(name.to_string(), "000000010000000000000A5F");
    }

    #[test]
    fn test_next_simple_increment() {
        let name: SegmentName = "000000010000000000000051".parse().unwrap();
        assert_eq!(name.next().unwrap().to_string(), "000000010000000000000052");

        let name: SegmentName = "00000001000000000000005F".parse().unwrap();
        assert_eq!(name.next().unwrap().to_string(), "000000010000000000000060");
    }

    #[test]
    fn test_next_carries_into_log_file() {
        let name: SegmentName = "0000000100000001000000FF".parse().unwrap();
        assert_eq!(name.next().unwrap().to_string(), "000000010000000200000000");
    }

    #[test]
    fn test_segment_component_out_of_range() {
        let err = "0000000100000001000001FF".parse::<SegmentName>().unwrap_err();
        assert_eq!(err, FormatError::SegmentOutOfRange(0x1FF));
    }

    #[test]
    fn test_non_hex_rejected() {
        let err = "00000001000ZZ001000000FF".parse::<SegmentName>().unwrap_err();
        assert!(matches!(err, FormatError::NotHex(_)));
    }

    #[test]
    fn test_wrong_length_rejected() {
        let err = "00000001000001000000FF".parse::<SegmentName>().unwrap_err();
        assert!(matches!(err, FormatError::BadLength(_)));

        let err = "asdfasdf".parse::<SegmentName>().unwrap_err();
        assert!(matches!(err, FormatError::BadLength(_)));
    }

    #[test]
    fn test_next_fails_at_log_ceiling() {
        let name: SegmentName = "00000001FFFFFFFF000000FF".parse().unwrap();
        assert_eq!(name.next().unwrap_err(), FormatError::LogOverflow);
    }

    #[test]
    fn test_ordering_matches_archive_order() {
        let a: SegmentName = "0000000100000001000000FF".parse().unwrap();
        let b: SegmentName = "000000010000000200000000".parse().unwrap();
        assert!(a < b);
        assert_eq!(a.next().unwrap(), b);
    }

    #[test]
    fn test_lsn_parse() {
        let lsn: Lsn = "2/E5000028".parse().unwrap();
        assert_eq!(lsn.as_u64(), 0x2E5000028);
        assert_eq!(lsn.to_string(), "2/E5000028");
    }

    #[test]
    fn test_lsn_malformed() {
        assert!("2E5000028".parse::<Lsn>().is_err());
        assert!("2/".parse::<Lsn>().is_err());
        assert!("/E5000028".parse::<Lsn>().is_err());
        assert!("2/GG000028".parse::<Lsn>().is_err());
    }

    proptest! {
        // A full cycle of the segment counter carries into the log-file
        // component exactly once, leaving the segment component unchanged.
        #[test]
        fn prop_full_segment_cycle_increments_log_once(
            timeline in 1u32..=0xFF,
            log in 0u32..0xFFFF_FFFE,
            segment in 0u32..SEGMENTS_PER_LOG,
        ) {
            let start = SegmentName::new(timeline, log, segment).unwrap();
            let mut name = start;
            for _ in 0..SEGMENTS_PER_LOG {
                name = name.next().unwrap();
            }
            prop_assert_eq!(name.timeline(), start.timeline());
            prop_assert_eq!(name.log(), start.log() + 1);
            prop_assert_eq!(name.segment(), start.segment());
        }

        #[test]
        fn prop_parse_display_roundtrip(
            timeline in 0u32..=u32::MAX,
            log in 0u32..=u32::MAX,
            segment in 0u32..SEGMENTS_PER_LOG,
        ) {
            let name = SegmentName::new(timeline, log, segment).unwrap();
            let text = name.to_string();
            prop_assert_eq!(text.len(), SEGMENT_NAME_LEN);
            prop_assert_eq!(text.parse::<SegmentName>().unwrap(), name);
        }
    }
}
