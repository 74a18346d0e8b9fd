//! Queue persistence hooks
//!
//! The engine treats persistence as an opaque collaborator: it captures a
//! serializable snapshot of the queue under the lock and hands it to a
//! [`QueuePersistence`] implementation outside the lock. The engine is
//! fully operational with [`NoOpPersistence`]; [`JsonDiskPersistence`]
//! stores snapshots as JSON files, written atomically via a temp file.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{DownloadQueue, FileInfo, NzbInfo, OutputState};
use crate::error::Result;
use crate::types::{ArticleStatus, FileId, NzbId, PostStage, Priority};

/// Serializable image of one article
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArticleSnapshot {
    /// Part number
    pub part_number: u32,
    /// Message id
    pub message_id: String,
    /// Size in bytes
    pub size: u64,
    /// Status; Running collapses to Undefined on capture
    pub status: ArticleStatus,
    /// Temp file path
    pub result_filename: PathBuf,
}

/// Serializable image of one file
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileSnapshot {
    /// File id
    pub id: FileId,
    /// Subject line
    pub subject: String,
    /// Decoded filename
    pub filename: String,
    /// Filename confirmed by decoder metadata
    pub filename_confirmed: bool,
    /// Newsgroups
    pub groups: Vec<String>,
    /// Priority
    pub priority: Priority,
    /// Paused flag
    pub paused: bool,
    /// Deleted flag
    pub deleted: bool,
    /// Direct-write output path
    pub output_filename: Option<PathBuf>,
    /// Articles in part order
    pub articles: Vec<ArticleSnapshot>,
}

/// Serializable image of one bundle
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NzbSnapshot {
    /// Bundle id
    pub id: NzbId,
    /// Display name
    pub name: String,
    /// Destination directory
    pub dest_dir: PathBuf,
    /// Category
    pub category: Option<String>,
    /// Paused flag
    pub paused: bool,
    /// Post pipeline stage
    pub post_stage: PostStage,
    /// Files in manifest order
    pub files: Vec<FileSnapshot>,
    /// Paths assembled so far
    pub completed_files: Vec<PathBuf>,
}

/// Serializable image of the whole queue
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// Bundles in queue order
    pub nzbs: Vec<NzbSnapshot>,
    /// Id counter state, so restored queues keep allocating unique ids
    pub next_nzb_id: i64,
    /// Id counter state
    pub next_file_id: i64,
    /// Id counter state
    pub next_article_id: i64,
}

/// Serializable image of one post-pipeline entry
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PostSnapshot {
    /// Bundle id
    pub nzb_id: NzbId,
    /// Current stage
    pub stage: PostStage,
}

impl QueueSnapshot {
    /// Capture the queue. Running articles are recorded as Undefined: their
    /// workers will not exist in the process that restores the snapshot.
    pub fn capture(queue: &DownloadQueue) -> Self {
        Self {
            nzbs: queue
                .nzbs()
                .iter()
                .filter(|n| !n.deleted)
                .map(NzbSnapshot::capture)
                .collect(),
            next_nzb_id: queue.next_nzb_id,
            next_file_id: queue.next_file_id,
            next_article_id: queue.next_article_id,
        }
    }

    /// Rebuild a queue from the snapshot, recomputing all derived counters
    pub fn restore(self) -> DownloadQueue {
        let mut queue = DownloadQueue {
            nzbs: Vec::with_capacity(self.nzbs.len()),
            next_nzb_id: self.next_nzb_id,
            next_file_id: self.next_file_id,
            next_article_id: self.next_article_id,
        };
        for nzb in self.nzbs {
            queue.nzbs.push(nzb.restore());
        }
        queue
    }
}

impl NzbSnapshot {
    fn capture(nzb: &NzbInfo) -> Self {
        Self {
            id: nzb.id,
            name: nzb.name.clone(),
            dest_dir: nzb.dest_dir.clone(),
            category: nzb.category.clone(),
            paused: nzb.paused,
            post_stage: nzb.post_stage.clone(),
            files: nzb.files.iter().map(FileSnapshot::capture).collect(),
            completed_files: nzb.completed_files.clone(),
        }
    }

    fn restore(self) -> NzbInfo {
        let mut nzb = NzbInfo::new(self.name, self.dest_dir);
        nzb.id = self.id;
        nzb.category = self.category;
        nzb.paused = self.paused;
        nzb.post_stage = self.post_stage;
        nzb.completed_files = self.completed_files;
        for file in self.files {
            let nzb_id = self.id;
            let mut restored = file.restore();
            restored.nzb_id = nzb_id;
            // add_file only accumulates size/count; fold terminal counters
            // in by hand
            nzb.success_size += restored.success_size;
            nzb.failed_size += restored.failed_size;
            nzb.success_articles += restored.success_articles;
            nzb.failed_articles += restored.failed_articles;
            nzb.add_file(restored);
        }
        nzb
    }
}

impl FileSnapshot {
    fn capture(file: &FileInfo) -> Self {
        Self {
            id: file.id,
            subject: file.subject.clone(),
            filename: file.filename.clone(),
            filename_confirmed: file.filename_confirmed,
            groups: file.groups.clone(),
            priority: file.priority,
            paused: file.paused,
            deleted: file.deleted,
            output_filename: file.output_filename.clone(),
            articles: file
                .articles
                .iter()
                .map(|a| ArticleSnapshot {
                    part_number: a.part_number,
                    message_id: a.message_id.clone(),
                    size: a.size,
                    status: match a.status {
                        ArticleStatus::Running => ArticleStatus::Undefined,
                        other => other,
                    },
                    result_filename: a.result_filename.clone(),
                })
                .collect(),
        }
    }

    fn restore(self) -> FileInfo {
        let mut file = FileInfo::new(self.subject, self.filename, self.groups);
        file.id = self.id;
        file.filename_confirmed = self.filename_confirmed;
        file.priority = self.priority;
        file.paused = self.paused;
        file.deleted = self.deleted;
        file.output_filename = self.output_filename;
        file.output_state = Arc::new(Mutex::new(OutputState::default()));
        for article in self.articles {
            file.add_article(article.part_number, article.message_id, article.size);
            if let Some(restored) = file.articles.last_mut() {
                restored.status = article.status;
                restored.result_filename = article.result_filename;
            }
            match article.status {
                ArticleStatus::Finished => {
                    file.remaining_size -= article.size;
                    file.success_size += article.size;
                    file.success_articles += 1;
                    file.completed_articles += 1;
                }
                ArticleStatus::Failed => {
                    file.remaining_size -= article.size;
                    file.failed_size += article.size;
                    file.failed_articles += 1;
                    file.completed_articles += 1;
                }
                ArticleStatus::Undefined | ArticleStatus::Running => {}
            }
        }
        file
    }
}

/// Persistence hooks consumed by the engine
#[async_trait]
pub trait QueuePersistence: Send + Sync {
    /// Store the queue snapshot
    async fn save_queue(&self, snapshot: &QueueSnapshot) -> Result<()>;

    /// Load the most recent queue snapshot, if any
    async fn load_queue(&self) -> Result<Option<QueueSnapshot>>;

    /// Store the post-pipeline state
    async fn save_post_queue(&self, entries: &[PostSnapshot]) -> Result<()>;
}

/// Persistence that stores nothing; the engine runs fine without it
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpPersistence;

#[async_trait]
impl QueuePersistence for NoOpPersistence {
    async fn save_queue(&self, _snapshot: &QueueSnapshot) -> Result<()> {
        Ok(())
    }

    async fn load_queue(&self) -> Result<Option<QueueSnapshot>> {
        Ok(None)
    }

    async fn save_post_queue(&self, _entries: &[PostSnapshot]) -> Result<()> {
        Ok(())
    }
}

/// JSON snapshot files in a state directory, written atomically
#[derive(Clone, Debug)]
pub struct JsonDiskPersistence {
    dir: PathBuf,
}

impl JsonDiskPersistence {
    /// Store snapshots under `dir` (created on first save)
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    async fn write_atomic(&self, name: &str, contents: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let tmp = self.dir.join(format!("{name}.tmp"));
        let target = self.dir.join(name);
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, &target).await?;
        Ok(())
    }
}

#[async_trait]
impl QueuePersistence for JsonDiskPersistence {
    async fn save_queue(&self, snapshot: &QueueSnapshot) -> Result<()> {
        let json = serde_json::to_vec_pretty(snapshot)?;
        self.write_atomic("queue.json", &json).await
    }

    async fn load_queue(&self) -> Result<Option<QueueSnapshot>> {
        let path = self.dir.join("queue.json");
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save_post_queue(&self, entries: &[PostSnapshot]) -> Result<()> {
        let json = serde_json::to_vec_pretty(entries)?;
        self.write_atomic("postqueue.json", &json).await
    }
}
