//! Core types for usenet-engine

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Unique identifier for a bundle (one NZB's worth of files)
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NzbId(pub i64);

impl NzbId {
    /// Create a new NzbId
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the inner i64 value
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl From<i64> for NzbId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for NzbId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a file within the queue
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(pub i64);

impl FileId {
    /// Get the inner i64 value
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identifier of a news server in the pool
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(pub u32);

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "server{}", self.0)
    }
}

/// Lifecycle state of one article
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArticleStatus {
    /// Not yet dispatched to a worker
    #[default]
    Undefined,
    /// Currently held by a worker
    Running,
    /// Downloaded and decoded successfully
    Finished,
    /// Terminally failed on every eligible server
    Failed,
}

/// Outcome of one download attempt (or of the whole failover loop) for an
/// article. Connection-level problems never surface here per-article; they
/// are retried inside the loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArticleOutcome {
    /// Article downloaded, decoded and verified
    Finished,
    /// Socket/TLS/auth failure or a 400/499-class response
    ConnectError,
    /// Article or group missing on this server (41x/42x/43x)
    NotFound,
    /// Decoder CRC mismatch
    CrcError,
    /// Incomplete article, protocol mismatch, unexpected response
    Failed,
    /// Local file could not be created or written
    FatalError,
    /// Pause or stop observed mid-flight; re-queue without counting
    Retry,
}

/// Download priority
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Low priority (-1)
    Low = -1,
    /// Normal priority (0)
    #[default]
    Normal = 0,
    /// High priority (1)
    High = 1,
    /// Force start immediately (2)
    Force = 2,
}

/// Stage of a bundle's post-download par pipeline
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostStage {
    /// Waiting for the par coordinator to pick the bundle up
    #[default]
    Queued,
    /// Reading par files from disk
    LoadingPars,
    /// Verifying downloaded source files
    VerifyingSources,
    /// Reconstructing damaged blocks
    Repairing,
    /// Re-verifying after repair
    VerifyingRepaired,
    /// Pipeline completed
    Finished,
    /// Pipeline aborted
    Failed {
        /// Why the pipeline was aborted
        reason: String,
    },
}

/// Editor actions accepted by [`crate::engine::DownloadEngine::edit_list`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EditAction {
    /// Pause the bundles
    Pause,
    /// Resume the bundles
    Resume,
    /// Delete the bundles from the queue
    Delete,
    /// Move the bundles by `offset` positions (negative = towards the head)
    MoveOffset,
    /// Move the bundles to the head of the queue
    MoveTop,
    /// Move the bundles to the tail of the queue
    MoveBottom,
    /// Merge the bundles into the first id of the list
    Merge,
}

/// Event emitted on queue and download state transitions
///
/// Consumers subscribe through [`crate::engine::DownloadEngine::subscribe`];
/// events are broadcast, and dropped silently when nobody listens.
#[derive(Clone, Debug)]
pub enum Event {
    /// A bundle was added to the queue
    NzbAdded {
        /// Bundle ID
        id: NzbId,
        /// Bundle name
        name: String,
    },

    /// A bundle left the queue (finished, deleted or merged away)
    NzbRemoved {
        /// Bundle ID
        id: NzbId,
    },

    /// All files of a bundle finished downloading
    NzbComplete {
        /// Bundle ID
        id: NzbId,
        /// Number of articles that failed
        articles_failed: u64,
        /// Total number of articles
        articles_total: u64,
    },

    /// A bundle was deleted because its health fell below the critical mark
    NzbHealthDeleted {
        /// Bundle ID
        id: NzbId,
        /// Health at the moment of deletion, in permille
        health: u32,
    },

    /// One article terminally failed
    ArticleFailed {
        /// Owning file
        file_id: FileId,
        /// Article message id
        message_id: String,
    },

    /// One file finished (all articles terminal) and was assembled
    FileCompleted {
        /// Bundle ID
        id: NzbId,
        /// File ID
        file_id: FileId,
        /// Final filename
        filename: String,
        /// Whether some articles failed (file is broken)
        broken: bool,
    },

    /// A file was deleted from the queue
    FileDeleted {
        /// Bundle ID
        id: NzbId,
        /// File ID
        file_id: FileId,
    },

    /// The par pipeline for a bundle changed stage
    PostStageChanged {
        /// Bundle ID
        id: NzbId,
        /// New stage
        stage: PostStage,
    },

    /// The par coordinator unpaused recovery files
    RecoveryUnpaused {
        /// Bundle ID
        id: NzbId,
        /// Blocks that were requested
        blocks_needed: u32,
        /// Blocks made available by unpausing
        blocks_found: u32,
    },

    /// Downloading was paused
    DownloadPaused,

    /// Downloading was resumed
    DownloadResumed,

    /// The configured download rate changed
    DownloadRateChanged {
        /// New limit in bytes per second (0 = unlimited)
        rate_bps: u64,
    },

    /// Graceful shutdown initiated
    Shutdown,
}

/// Snapshot counters for one bundle, as reported to observers
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NzbStats {
    /// Bundle ID
    pub id: NzbId,
    /// Bundle name
    pub name: String,
    /// Destination directory
    pub dest_dir: PathBuf,
    /// Total size of all articles in bytes
    pub size: u64,
    /// Bytes of articles downloaded successfully
    pub success_size: u64,
    /// Bytes of articles that terminally failed
    pub failed_size: u64,
    /// Bytes not yet finished
    pub remaining_size: u64,
    /// Total article count
    pub article_count: u64,
    /// Successfully downloaded article count
    pub success_articles: u64,
    /// Terminally failed article count
    pub failed_articles: u64,
    /// Health in permille: 1000 = no failures so far
    pub health: u32,
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_orders_force_above_low() {
        assert!(Priority::Force > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn article_status_defaults_to_undefined() {
        assert_eq!(ArticleStatus::default(), ArticleStatus::Undefined);
    }

    #[test]
    fn nzb_id_display_matches_inner_value() {
        assert_eq!(NzbId::new(42).to_string(), "42");
    }

    #[test]
    fn server_id_display_is_prefixed() {
        assert_eq!(ServerId(3).to_string(), "server3");
    }

    #[test]
    fn post_stage_failed_carries_reason() {
        let stage = PostStage::Failed {
            reason: "cancelled".into(),
        };
        match stage {
            PostStage::Failed { reason } => assert_eq!(reason, "cancelled"),
            other => panic!("unexpected stage {other:?}"),
        }
    }
}
