//! Work items passed between producers and the worker pools.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::oneshot;

/// Told once a work item has been uploaded, or why it never will be.
pub type CompletionSender = oneshot::Sender<Result<(), String>>;

/// What a queued file is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkKind {
    /// Output of a basebackup job.
    BasebackupChunk,
    /// A closed WAL segment written by the log streamer.
    WalSegment,
}

impl WorkKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BasebackupChunk => "basebackup_chunk",
            Self::WalSegment => "wal_segment",
        }
    }
}

/// A compression or transfer queue entry.
///
/// Created by a producer and consumed exactly once by a worker.
#[derive(Debug)]
pub struct WorkItem {
    pub site: String,
    pub source_path: PathBuf,
    pub kind: WorkKind,
    pub delete_source_after_success: bool,
    /// Object metadata forwarded to the upload.
    pub metadata: BTreeMap<String, String>,
    /// Carried through every stage and fired by the last one.
    pub completion: Option<CompletionSender>,
}

impl WorkItem {
    /// A WAL segment picked up from the streamer's directory.
    pub fn wal_segment(site: impl Into<String>, source_path: impl Into<PathBuf>) -> Self {
        Self {
            site: site.into(),
            source_path: source_path.into(),
            kind: WorkKind::WalSegment,
            delete_source_after_success: true,
            metadata: BTreeMap::new(),
            completion: None,
        }
    }

    /// A file produced by a basebackup job.
    pub fn basebackup(
        site: impl Into<String>,
        source_path: impl Into<PathBuf>,
        metadata: BTreeMap<String, String>,
    ) -> Self {
        Self {
            site: site.into(),
            source_path: source_path.into(),
            kind: WorkKind::BasebackupChunk,
            delete_source_after_success: true,
            metadata,
            completion: None,
        }
    }

    /// Ask to be told when the upload of this item has finished.
    pub fn with_completion(mut self, completion: CompletionSender) -> Self {
        self.completion = Some(completion);
        self
    }

    /// Detach the completion sender, leaving the item without one.
    pub fn take_completion(&mut self) -> Option<CompletionSender> {
        self.completion.take()
    }

    /// File name of the source, used as the object name.
    pub fn file_name(&self) -> Option<String> {
        self.source_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
    }
}

/// Fire a completion sender, if any. A receiver that went away is ignored.
pub fn report_completion(completion: Option<CompletionSender>, result: Result<(), String>) {
    if let Some(completion) = completion {
        let _ = completion.send(result);
    }
}
