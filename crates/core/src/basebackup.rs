//! Basebackup records as listed from object storage.

use crate::error::{Error, Result};
use crate::wal::SegmentId;
use crate::{META_START_TIME, META_START_WAL_SEGMENT};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// A basebackup stored remotely.
///
/// Records are immutable once listed; the remote listing is the source of
/// truth and is re-read periodically.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasebackupRecord {
    /// Object name relative to the site's basebackup prefix.
    pub name: String,
    /// When the basebackup started.
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    /// Oldest WAL segment needed to restore from this basebackup.
    pub start_wal_segment: SegmentId,
}

impl BasebackupRecord {
    /// Build a record from an object name and its stored metadata.
    pub fn from_metadata(name: &str, metadata: &BTreeMap<String, String>) -> Result<Self> {
        let invalid = |reason: String| Error::InvalidBasebackup {
            name: name.to_string(),
            reason,
        };

        let start_time = metadata
            .get(META_START_TIME)
            .ok_or_else(|| invalid(format!("missing {META_START_TIME}")))?;
        let start_time = OffsetDateTime::parse(start_time, &Rfc3339)
            .map_err(|e| invalid(format!("bad {META_START_TIME} {start_time:?}: {e}")))?;

        let segment = metadata
            .get(META_START_WAL_SEGMENT)
            .ok_or_else(|| invalid(format!("missing {META_START_WAL_SEGMENT}")))?;
        let start_wal_segment = SegmentId::parse(segment)
            .map_err(|e| invalid(format!("bad {META_START_WAL_SEGMENT}: {e}")))?;

        Ok(Self {
            name: name.to_string(),
            start_time,
            start_wal_segment,
        })
    }
}

/// Metadata attached to an uploaded basebackup object.
pub fn basebackup_metadata(
    start_time: OffsetDateTime,
    start_wal_segment: SegmentId,
) -> Result<BTreeMap<String, String>> {
    let start_time = start_time
        .format(&Rfc3339)
        .map_err(|e| Error::InvalidBasebackup {
            name: start_wal_segment.name(),
            reason: e.to_string(),
        })?;

    Ok(BTreeMap::from([
        (META_START_TIME.to_string(), start_time),
        (META_START_WAL_SEGMENT.to_string(), start_wal_segment.name()),
    ]))
}

/// Sort records oldest first, the order retention relies on.
pub fn sort_by_start_time(records: &mut [BasebackupRecord]) {
    records.sort_by(|a, b| {
        a.start_time
            .cmp(&b.start_time)
            .then_with(|| a.name.cmp(&b.name))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn meta(start_time: &str, segment: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            (META_START_TIME.to_string(), start_time.to_string()),
            (META_START_WAL_SEGMENT.to_string(), segment.to_string()),
        ])
    }

    #[test]
    fn from_metadata_parses_fields() {
        let record = BasebackupRecord::from_metadata(
            "2024-05-01_00-00-00",
            &meta("2024-05-01T00:00:00Z", "000000010000000000000004"),
        )
        .unwrap();

        assert_eq!(record.name, "2024-05-01_00-00-00");
        assert_eq!(record.start_time, datetime!(2024-05-01 00:00:00 UTC));
        assert_eq!(record.start_wal_segment, SegmentId::new(1, 0, 4));
    }

    #[test]
    fn from_metadata_rejects_missing_or_bad_fields() {
        let missing = BTreeMap::new();
        assert!(BasebackupRecord::from_metadata("a", &missing).is_err());

        let bad_time = meta("yesterday", "000000010000000000000004");
        assert!(BasebackupRecord::from_metadata("b", &bad_time).is_err());

        let bad_segment = meta("2024-05-01T00:00:00Z", "not-a-segment");
        let err = BasebackupRecord::from_metadata("c", &bad_segment).unwrap_err();
        assert!(err.to_string().contains("start-wal-segment"));
    }

    #[test]
    fn metadata_roundtrip_through_record() {
        let start = datetime!(2024-05-02 10:30:00 UTC);
        let metadata = basebackup_metadata(start, SegmentId::new(2, 1, 0x10)).unwrap();
        let record = BasebackupRecord::from_metadata("x", &metadata).unwrap();
        assert_eq!(record.start_time, start);
        assert_eq!(record.start_wal_segment, SegmentId::new(2, 1, 0x10));
    }

    #[test]
    fn sort_orders_by_start_time() {
        let mut records = vec![
            BasebackupRecord::from_metadata("late", &meta("2024-05-03T00:00:00Z", "000000010000000000000009")).unwrap(),
            BasebackupRecord::from_metadata("early", &meta("2024-05-01T00:00:00Z", "000000010000000000000001")).unwrap(),
        ];
        sort_by_start_time(&mut records);
        assert_eq!(records[0].name, "early");
        assert_eq!(records[1].name, "late");
    }
}
