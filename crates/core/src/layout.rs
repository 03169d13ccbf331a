//! Local directory and remote key layout per site.

use std::path::{Path, PathBuf};

use crate::work::WorkKind;

const BASEBACKUP_DIR: &str = "basebackup";
const XLOG_DIR: &str = "xlog";
const INCOMING_SUFFIX: &str = "_incoming";

/// Remote prefix holding a site's basebackups.
pub fn remote_basebackup_prefix(path_prefix: &str, site: &str) -> String {
    join_key(&[path_prefix, site, BASEBACKUP_DIR])
}

/// Remote key of a basebackup object.
pub fn remote_basebackup_key(path_prefix: &str, site: &str, name: &str) -> String {
    join_key(&[path_prefix, site, BASEBACKUP_DIR, name])
}

/// Remote key of a WAL segment.
pub fn remote_wal_key(path_prefix: &str, site: &str, segment_name: &str) -> String {
    join_key(&[path_prefix, site, XLOG_DIR, segment_name])
}

/// Remote key for a queued file of the given kind.
pub fn remote_key_for(path_prefix: &str, site: &str, kind: WorkKind, name: &str) -> String {
    match kind {
        WorkKind::BasebackupChunk => remote_basebackup_key(path_prefix, site, name),
        WorkKind::WalSegment => remote_wal_key(path_prefix, site, name),
    }
}

fn join_key(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|part| part.trim_matches('/'))
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Local working directories of one site.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SitePaths {
    pub root: PathBuf,
    /// Compressed WAL awaiting upload.
    pub xlog: PathBuf,
    /// Where the log streamer writes segments.
    pub xlog_incoming: PathBuf,
    /// Compressed basebackups awaiting upload.
    pub basebackup: PathBuf,
    /// Where basebackup jobs write their output.
    pub basebackup_incoming: PathBuf,
}

impl SitePaths {
    pub fn new(backup_location: &Path, path_prefix: &str, site: &str) -> Self {
        let mut root = backup_location.to_path_buf();
        let prefix = path_prefix.trim_matches('/');
        if !prefix.is_empty() {
            root.push(prefix);
        }
        root.push(site);

        Self {
            xlog: root.join(XLOG_DIR),
            xlog_incoming: root.join(format!("{XLOG_DIR}{INCOMING_SUFFIX}")),
            basebackup: root.join(BASEBACKUP_DIR),
            basebackup_incoming: root.join(format!("{BASEBACKUP_DIR}{INCOMING_SUFFIX}")),
            root,
        }
    }

    /// Every directory that must exist before the site is handled.
    pub fn all(&self) -> [&Path; 5] {
        [
            &self.root,
            &self.xlog,
            &self.xlog_incoming,
            &self.basebackup,
            &self.basebackup_incoming,
        ]
    }

    /// Local directory for compressed output of the given kind.
    pub fn compressed_dir(&self, kind: WorkKind) -> &Path {
        match kind {
            WorkKind::BasebackupChunk => &self.basebackup,
            WorkKind::WalSegment => &self.xlog,
        }
    }
}
