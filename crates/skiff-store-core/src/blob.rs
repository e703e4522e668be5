//! Blob naming for the multi-blob log layout.

use std::fmt;

use crate::{Result, StoreError};

const PREFIX: &str = "events.";
const COMPACT_SUFFIX: &str = ".compact";
const INDEX_DIGITS: usize = 5;

/// Name of one blob in a stream: `events.NNNNN`, optionally suffixed
/// `.compact` for the single compacted blob.
///
/// The index is a 5-digit zero-padded decimal starting at 0. At most one
/// compact blob may exist in a layout and it must be the lowest-indexed one;
/// that invariant is the driver's to enforce, not the name's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlobName {
    index: u32,
    compact: bool,
}

impl BlobName {
    /// The regular (non-compact) blob at `index`.
    pub fn events(index: u32) -> Self {
        Self { index, compact: false }
    }

    /// The compacted blob covering indices `0..=index`.
    pub fn compacted(index: u32) -> Self {
        Self { index, compact: true }
    }

    /// Blob index within the stream.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Whether this is the compacted blob.
    pub fn is_compact(&self) -> bool {
        self.compact
    }

    /// The regular blob that follows this one.
    pub fn next(&self) -> Self {
        Self::events(self.index + 1)
    }

    /// Parse either a regular or a compact blob name.
    pub fn parse(name: &str) -> Result<Self> {
        let reject = || StoreError::BlobName(name.to_string());
        let rest = name.strip_prefix(PREFIX).ok_or_else(reject)?;
        let (digits, compact) = match rest.strip_suffix(COMPACT_SUFFIX) {
            Some(digits) => (digits, true),
            None => (rest, false),
        };
        if digits.len() != INDEX_DIGITS || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(reject());
        }
        let index = digits.parse::<u32>().map_err(|_| reject())?;
        Ok(Self { index, compact })
    }

    /// Parse a regular blob name, rejecting `.compact` suffixes and
    /// non-decimal indices.
    pub fn parse_events(name: &str) -> Result<Self> {
        let parsed = Self::parse(name)?;
        if parsed.compact {
            return Err(StoreError::BlobName(name.to_string()));
        }
        Ok(parsed)
    }
}

impl fmt::Display for BlobName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PREFIX}{:05}", self.index)?;
        if self.compact {
            f.write_str(COMPACT_SUFFIX)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_regular_names() {
        assert_eq!(BlobName::parse_events("events.00000").unwrap(), BlobName::events(0));
        assert_eq!(BlobName::parse_events("events.00042").unwrap(), BlobName::events(42));
        assert_eq!(
            BlobName::parse_events("events.99999").unwrap(),
            BlobName::events(99_999)
        );
    }

    #[test]
    fn events_parser_rejects_compact_names() {
        assert!(BlobName::parse_events("events.00001.compact").is_err());
        // The permissive parser accepts them.
        let parsed = BlobName::parse("events.00001.compact").unwrap();
        assert!(parsed.is_compact());
        assert_eq!(parsed.index(), 1);
    }

    #[test]
    fn rejects_non_decimal_and_misshapen_indices() {
        for bad in [
            "events.0000a",
            "events.0000A",
            "events.0000f",
            "events.000ff",
            "events.1234",
            "events.123456",
            "events.",
            "events.00-01",
            "snapshots.00001",
            "events.00001.compact.compact",
        ] {
            assert!(BlobName::parse_events(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn display_round_trips() {
        for name in [BlobName::events(0), BlobName::events(7), BlobName::compacted(3)] {
            assert_eq!(BlobName::parse(&name.to_string()).unwrap(), name);
        }
        assert_eq!(BlobName::events(7).to_string(), "events.00007");
        assert_eq!(BlobName::compacted(3).to_string(), "events.00003.compact");
    }

    #[test]
    fn ordering_follows_indices() {
        assert!(BlobName::compacted(1) < BlobName::events(2));
        assert!(BlobName::events(2) < BlobName::events(10));
    }
}
