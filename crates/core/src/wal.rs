//! Write-ahead log segment identifiers.
//!
//! Segment file names follow the PostgreSQL convention of 24 upper-case hex
//! digits: timeline, log and segment number, eight digits each.

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Size of a single WAL segment (16 MiB).
pub const WAL_SEGMENT_SIZE: u64 = 16 * 1024 * 1024;

/// Highest segment number within one log file for 16 MiB segments.
pub const MAX_SEGMENT: u32 = 0xFF;

/// Length of a WAL segment file name.
pub const WAL_NAME_LEN: usize = 24;

/// Identifier of one WAL segment: `(timeline, log, seg)`.
///
/// Ordering is lexicographic over the three fields, so a segment on an older
/// timeline always sorts before any segment on a newer one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentId {
    pub timeline: u32,
    pub log: u32,
    pub seg: u32,
}

impl SegmentId {
    pub const fn new(timeline: u32, log: u32, seg: u32) -> Self {
        Self { timeline, log, seg }
    }

    /// Parse a segment file name such as `000000010000000A000000FF`.
    pub fn parse(name: &str) -> Result<Self> {
        if name.len() != WAL_NAME_LEN || !name.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::InvalidWalSegment(name.to_string()));
        }

        let field = |range: std::ops::Range<usize>| {
            u32::from_str_radix(&name[range], 16)
                .map_err(|_| Error::InvalidWalSegment(name.to_string()))
        };

        Ok(Self {
            timeline: field(0..8)?,
            log: field(8..16)?,
            seg: field(16..24)?,
        })
    }

    /// Derive the segment holding a WAL location like `16/B374D848`.
    pub fn from_lsn(timeline: u32, lsn: &str) -> Result<Self> {
        let (hi, lo) = lsn
            .split_once('/')
            .ok_or_else(|| Error::InvalidWalSegment(lsn.to_string()))?;
        let log = u32::from_str_radix(hi, 16)
            .map_err(|_| Error::InvalidWalSegment(lsn.to_string()))?;
        let offset = u64::from_str_radix(lo, 16)
            .map_err(|_| Error::InvalidWalSegment(lsn.to_string()))?;
        if offset > u64::from(u32::MAX) {
            return Err(Error::InvalidWalSegment(lsn.to_string()));
        }

        Ok(Self {
            timeline,
            log,
            seg: (offset / WAL_SEGMENT_SIZE) as u32,
        })
    }

    /// File name for this segment.
    pub fn name(&self) -> String {
        format!("{:08X}{:08X}{:08X}", self.timeline, self.log, self.seg)
    }

    /// The segment preceding this one on the same timeline.
    ///
    /// Returns `None` at `log == 0 && seg == 0`, the start of history.
    pub fn previous_on_timeline(&self) -> Option<Self> {
        match (self.log, self.seg) {
            (0, 0) => None,
            (log, 0) => Some(Self::new(self.timeline, log - 1, MAX_SEGMENT)),
            (log, seg) => Some(Self::new(self.timeline, log, seg - 1)),
        }
    }

    /// The same log/segment position on the parent timeline.
    ///
    /// Only valid while `timeline > 1`.
    pub fn decrement_timeline(&self) -> Option<Self> {
        (self.timeline > 1).then(|| Self::new(self.timeline - 1, self.log, self.seg))
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl FromStr for SegmentId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for SegmentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.name())
    }
}

impl<'de> Deserialize<'de> for SegmentId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Self::parse(&name).map_err(serde::de::Error::custom)
    }
}

/// Whether a file name is a complete WAL segment (not `.partial`, not a temp file).
pub fn is_wal_file_name(name: &str) -> bool {
    SegmentId::parse(name).is_ok()
}

/// Whether a file name is a timeline history file such as `00000002.history`.
pub fn is_timeline_history_file_name(name: &str) -> bool {
    name.strip_suffix(".history")
        .is_some_and(|tli| tli.len() == 8 && tli.bytes().all(|b| b.is_ascii_hexdigit()))
}
