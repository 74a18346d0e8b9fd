//! Download queue data model
//!
//! The queue owns every [`NzbInfo`]; an `NzbInfo` owns its [`FileInfo`]s,
//! which own their [`ArticleInfo`]s. Back-references are plain ids, valid
//! for the parent's lifetime inside the queue. The whole tree is protected
//! by one `tokio::sync::Mutex` held only for short critical sections —
//! workers snapshot an [`ArticleTask`] under the lock and do all socket and
//! disk I/O outside it.

pub mod persistence;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::types::{ArticleStatus, EditAction, FileId, NzbId, PostStage, Priority};

/// One NNTP-fetchable message, the atomic unit of transfer
#[derive(Clone, Debug)]
pub struct ArticleInfo {
    /// 1-based part number within the file
    pub part_number: u32,
    /// Message id, without the surrounding angle brackets
    pub message_id: String,
    /// Expected size in bytes
    pub size: u64,
    /// Lifecycle state
    pub status: ArticleStatus,
    /// Temp file receiving this article's decoded bytes
    pub result_filename: PathBuf,
}

/// Guarded per-file output state, touched only during direct-write
/// first-touch and final assembly
#[derive(Debug, Default)]
pub struct OutputState {
    /// The pre-allocated output file exists and has its final size
    pub initialized: bool,
    /// The file was detected as a duplicate and writing was short-circuited
    pub duplicate: bool,
}

/// One file of a bundle
#[derive(Debug)]
pub struct FileInfo {
    /// Stable id, assigned at enqueue
    pub id: FileId,
    /// Owning bundle (non-owning back-reference)
    pub nzb_id: NzbId,
    /// Subject line from the manifest
    pub subject: String,
    /// Decoded filename; possibly a guess until `filename_confirmed`
    pub filename: String,
    /// The filename was confirmed by in-band decoder metadata
    pub filename_confirmed: bool,
    /// Expected total size in bytes
    pub size: u64,
    /// Bytes of articles not yet finished
    pub remaining_size: u64,
    /// Bytes of successfully downloaded articles
    pub success_size: u64,
    /// Bytes of terminally failed articles
    pub failed_size: u64,
    /// Articles, in part order
    pub articles: Vec<ArticleInfo>,
    /// Newsgroups carrying this file, in preference order
    pub groups: Vec<String>,
    /// Scheduling priority
    pub priority: Priority,
    /// Paused by the user or the par coordinator
    pub paused: bool,
    /// Deleted (skipped by the dispatcher, kept for bookkeeping)
    pub deleted: bool,
    /// Direct-write output path, assigned at enqueue when enabled
    pub output_filename: Option<PathBuf>,
    /// Mutex guarding the output file and its `initialized` flag
    pub output_state: Arc<Mutex<OutputState>>,
    /// Articles currently held by workers
    pub active_downloads: usize,
    /// Articles in a terminal state
    pub completed_articles: u64,
    /// Successfully downloaded articles
    pub success_articles: u64,
    /// Terminally failed articles
    pub failed_articles: u64,
}

impl FileInfo {
    /// New file; ids are assigned when the bundle is enqueued
    pub fn new(
        subject: impl Into<String>,
        filename: impl Into<String>,
        groups: Vec<String>,
    ) -> Self {
        Self {
            id: FileId(0),
            nzb_id: NzbId(0),
            subject: subject.into(),
            filename: filename.into(),
            filename_confirmed: false,
            size: 0,
            remaining_size: 0,
            success_size: 0,
            failed_size: 0,
            articles: Vec::new(),
            groups,
            priority: Priority::Normal,
            paused: false,
            deleted: false,
            output_filename: None,
            output_state: Arc::new(Mutex::new(OutputState::default())),
            active_downloads: 0,
            completed_articles: 0,
            success_articles: 0,
            failed_articles: 0,
        }
    }

    /// Append one article; sizes are accumulated. Message ids are stored
    /// without the surrounding angle brackets, whichever way the manifest
    /// spelled them.
    pub fn add_article(&mut self, part_number: u32, message_id: impl Into<String>, size: u64) {
        let message_id = message_id.into();
        let message_id = message_id
            .trim_start_matches('<')
            .trim_end_matches('>')
            .to_string();
        self.articles.push(ArticleInfo {
            part_number,
            message_id,
            size,
            status: ArticleStatus::Undefined,
            result_filename: PathBuf::new(),
        });
        self.size += size;
        self.remaining_size += size;
    }

    /// Complete iff every article is terminal and no worker holds one
    pub fn is_complete(&self) -> bool {
        self.active_downloads == 0
            && self
                .articles
                .iter()
                .all(|a| matches!(a.status, ArticleStatus::Finished | ArticleStatus::Failed))
    }

    fn article_mut(&mut self, part_number: u32) -> Option<&mut ArticleInfo> {
        self.articles
            .iter_mut()
            .find(|a| a.part_number == part_number)
    }
}

/// One manifest's worth of files, downloaded together
#[derive(Debug)]
pub struct NzbInfo {
    /// Stable id, assigned at enqueue
    pub id: NzbId,
    /// Display name (the manifest's base name)
    pub name: String,
    /// Destination directory for assembled files
    pub dest_dir: PathBuf,
    /// Category label, if any
    pub category: Option<String>,
    /// Files, in manifest order
    pub files: Vec<FileInfo>,
    /// When the bundle entered the queue
    pub added_at: DateTime<Utc>,
    /// Total size of all articles
    pub size: u64,
    /// Bytes downloaded successfully
    pub success_size: u64,
    /// Bytes terminally failed
    pub failed_size: u64,
    /// Total article count
    pub article_count: u64,
    /// Successfully downloaded articles
    pub success_articles: u64,
    /// Terminally failed articles
    pub failed_articles: u64,
    /// Articles currently held by workers, across all files
    pub active_downloads: usize,
    /// Paused by the user
    pub paused: bool,
    /// Deleted (awaiting release once workers let go)
    pub deleted: bool,
    /// Post-download pipeline stage
    pub post_stage: PostStage,
    /// Paths of files assembled so far
    pub completed_files: Vec<PathBuf>,
}

impl NzbInfo {
    /// New bundle; the id is assigned when it is enqueued
    pub fn new(name: impl Into<String>, dest_dir: impl Into<PathBuf>) -> Self {
        Self {
            id: NzbId(0),
            name: name.into(),
            dest_dir: dest_dir.into(),
            category: None,
            files: Vec::new(),
            added_at: Utc::now(),
            size: 0,
            success_size: 0,
            failed_size: 0,
            article_count: 0,
            success_articles: 0,
            failed_articles: 0,
            active_downloads: 0,
            paused: false,
            deleted: false,
            post_stage: PostStage::Queued,
            completed_files: Vec::new(),
        }
    }

    /// Attach a file, folding its counters into the bundle aggregates
    pub fn add_file(&mut self, file: FileInfo) {
        self.size += file.size;
        self.article_count += file.articles.len() as u64;
        self.files.push(file);
    }

    /// Complete iff every non-deleted file is complete
    pub fn is_complete(&self) -> bool {
        self.files
            .iter()
            .filter(|f| !f.deleted)
            .all(FileInfo::is_complete)
    }

    /// Downloading is finished: every non-deleted, non-paused file is
    /// complete. Paused files (typically recovery volumes held back for
    /// par-repair) do not keep a bundle from entering post-processing.
    pub fn download_finished(&self) -> bool {
        self.files
            .iter()
            .filter(|f| !f.deleted && !f.paused)
            .all(FileInfo::is_complete)
    }

    /// Ready for the post pipeline: downloading finished *and* every
    /// completed file has been assembled into the destination. Workers
    /// assemble outside the queue lock, so article counters can be final
    /// while a joined file is still being written.
    pub fn ready_for_post(&self) -> bool {
        self.download_finished()
            && self.completed_files.len()
                >= self
                    .files
                    .iter()
                    .filter(|f| !f.deleted && !f.paused)
                    .count()
    }

    /// Health in permille: 1000 = no failed articles
    pub fn health(&self) -> u32 {
        if self.article_count == 0 {
            return 1000;
        }
        (1000 * (self.article_count - self.failed_articles) / self.article_count) as u32
    }

    /// Counter snapshot for observers
    pub fn stats(&self) -> crate::types::NzbStats {
        crate::types::NzbStats {
            id: self.id,
            name: self.name.clone(),
            dest_dir: self.dest_dir.clone(),
            size: self.size,
            success_size: self.success_size,
            failed_size: self.failed_size,
            remaining_size: self.files.iter().map(|f| f.remaining_size).sum(),
            article_count: self.article_count,
            success_articles: self.success_articles,
            failed_articles: self.failed_articles,
            health: self.health(),
        }
    }

    fn file_mut(&mut self, file_id: FileId) -> Option<&mut FileInfo> {
        self.files.iter_mut().find(|f| f.id == file_id)
    }
}

/// Work item handed to a worker under the queue lock; everything the
/// article downloader needs without touching the queue again
#[derive(Clone, Debug)]
pub struct ArticleTask {
    /// Owning bundle
    pub nzb_id: NzbId,
    /// Owning file
    pub file_id: FileId,
    /// 1-based part number
    pub part_number: u32,
    /// Message id, without angle brackets
    pub message_id: String,
    /// Expected size in bytes
    pub size: u64,
    /// Newsgroups to try for GROUP, in order
    pub groups: Vec<String>,
    /// Temp file for the decoded article
    pub result_filename: PathBuf,
    /// Direct-write output path, when enabled for the file
    pub output_filename: Option<PathBuf>,
    /// Shared output-file state of the owning file
    pub output_state: Arc<Mutex<OutputState>>,
    /// Short human-readable label for log lines
    pub info_name: String,
}

/// Everything the assembler needs to join a completed file, snapshotted
/// under the queue lock
#[derive(Clone, Debug)]
pub struct FileCompletion {
    /// Owning bundle
    pub nzb_id: NzbId,
    /// The completed file
    pub file_id: FileId,
    /// Bundle name (destination subdirectory)
    pub nzb_name: String,
    /// Destination directory of the bundle
    pub dest_dir: PathBuf,
    /// Final filename
    pub filename: String,
    /// (part number, temp file, finished?) for every article
    pub articles: Vec<(u32, PathBuf, bool)>,
    /// Successfully downloaded article count
    pub success_articles: u64,
    /// Terminally failed article count
    pub failed_articles: u64,
    /// Direct-write output path, when the file was written in place
    pub output_filename: Option<PathBuf>,
    /// Shared output-file state
    pub output_state: Arc<Mutex<OutputState>>,
}

impl FileCompletion {
    /// Total article count
    pub fn total_articles(&self) -> u64 {
        self.articles.len() as u64
    }

    /// True when at least one article failed
    pub fn broken(&self) -> bool {
        self.failed_articles > 0
    }
}

/// The shared queue: ordered bundles plus id counters
#[derive(Debug, Default)]
pub struct DownloadQueue {
    nzbs: Vec<NzbInfo>,
    next_nzb_id: i64,
    next_file_id: i64,
    /// Queue-wide article counter; temp files are named from it so resumed
    /// queues and merged bundles can never collide in the temp directory
    next_article_id: i64,
}

impl DownloadQueue {
    /// Empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Bundles in queue order
    pub fn nzbs(&self) -> &[NzbInfo] {
        &self.nzbs
    }

    /// Mutable access for editors holding the queue lock
    pub fn nzbs_mut(&mut self) -> &mut Vec<NzbInfo> {
        &mut self.nzbs
    }

    /// Find a bundle by id
    pub fn find_nzb(&self, id: NzbId) -> Option<&NzbInfo> {
        self.nzbs.iter().find(|n| n.id == id)
    }

    /// Find a bundle by id, mutably
    pub fn find_nzb_mut(&mut self, id: NzbId) -> Option<&mut NzbInfo> {
        self.nzbs.iter_mut().find(|n| n.id == id)
    }

    /// Append a bundle, assigning ids and per-article temp file names.
    ///
    /// Returns the assigned bundle id.
    pub fn add_nzb(&mut self, mut nzb: NzbInfo, temp_dir: &std::path::Path) -> NzbId {
        self.next_nzb_id += 1;
        nzb.id = NzbId(self.next_nzb_id);
        for file in &mut nzb.files {
            self.next_file_id += 1;
            file.id = FileId(self.next_file_id);
            file.nzb_id = nzb.id;
            for article in &mut file.articles {
                self.next_article_id += 1;
                article.result_filename = temp_dir.join(format!("{}.tmp", self.next_article_id));
            }
        }
        let id = nzb.id;
        self.nzbs.push(nzb);
        id
    }

    /// Remove a bundle entirely
    pub fn remove_nzb(&mut self, id: NzbId) -> Option<NzbInfo> {
        let idx = self.nzbs.iter().position(|n| n.id == id)?;
        Some(self.nzbs.remove(idx))
    }

    /// Pick the next article to download: highest file priority first, then
    /// insertion order; paused/deleted entries and files at their active
    /// cap are skipped. The chosen article transitions to Running.
    pub fn dispatch_next(&mut self, max_active_per_file: usize) -> Option<ArticleTask> {
        let mut best: Option<(usize, usize)> = None;
        let mut best_priority = Priority::Low;

        for (ni, nzb) in self.nzbs.iter().enumerate() {
            if nzb.paused || nzb.deleted {
                continue;
            }
            for (fi, file) in nzb.files.iter().enumerate() {
                if file.paused
                    || file.deleted
                    || file.active_downloads >= max_active_per_file
                    || !file
                        .articles
                        .iter()
                        .any(|a| a.status == ArticleStatus::Undefined)
                {
                    continue;
                }
                // Strictly greater keeps the first candidate in insertion
                // order among equal priorities.
                if best.is_none() || file.priority > best_priority {
                    best = Some((ni, fi));
                    best_priority = file.priority;
                }
            }
        }

        let (ni, fi) = best?;
        let nzb_id = self.nzbs[ni].id;
        let nzb_name = self.nzbs[ni].name.clone();
        let file = &mut self.nzbs[ni].files[fi];
        let article = file
            .articles
            .iter_mut()
            .find(|a| a.status == ArticleStatus::Undefined)?;
        article.status = ArticleStatus::Running;
        let task = ArticleTask {
            nzb_id,
            file_id: file.id,
            part_number: article.part_number,
            message_id: article.message_id.clone(),
            size: article.size,
            groups: file.groups.clone(),
            result_filename: article.result_filename.clone(),
            output_filename: file.output_filename.clone(),
            output_state: Arc::clone(&file.output_state),
            info_name: format!("{}/{} [{}]", nzb_name, file.filename, article.part_number),
        };
        file.active_downloads += 1;
        self.nzbs[ni].active_downloads += 1;
        Some(task)
    }

    /// Return a Running article to the head of its file (Retry outcome):
    /// back to Undefined without touching any counter.
    pub fn requeue_article(&mut self, file_id: FileId, part_number: u32) {
        if let Some((nzb_idx, file)) = self.locate_file(file_id) {
            if let Some(article) = file.article_mut(part_number) {
                if article.status == ArticleStatus::Running {
                    article.status = ArticleStatus::Undefined;
                    file.active_downloads = file.active_downloads.saturating_sub(1);
                    self.nzbs[nzb_idx].active_downloads =
                        self.nzbs[nzb_idx].active_downloads.saturating_sub(1);
                }
            }
        }
    }

    /// Record a terminal article outcome and maintain all counters.
    ///
    /// Idempotent: only a Running article transitions, so a duplicate
    /// completion report cannot advance counters a second time. Returns the
    /// file's completion snapshot when this article completed the file.
    pub fn finish_article(
        &mut self,
        file_id: FileId,
        part_number: u32,
        success: bool,
    ) -> Option<FileCompletion> {
        let (nzb_idx, file) = self.locate_file(file_id)?;
        let article = file.article_mut(part_number)?;
        if article.status != ArticleStatus::Running {
            return None;
        }
        article.status = if success {
            ArticleStatus::Finished
        } else {
            ArticleStatus::Failed
        };
        let article_size = article.size;

        file.active_downloads = file.active_downloads.saturating_sub(1);
        file.completed_articles += 1;
        file.remaining_size = file.remaining_size.saturating_sub(article_size);
        if success {
            file.success_size += article_size;
            file.success_articles += 1;
        } else {
            file.failed_size += article_size;
            file.failed_articles += 1;
        }

        let completion = if file.is_complete() {
            Some(FileCompletion {
                nzb_id: file.nzb_id,
                file_id: file.id,
                nzb_name: String::new(), // filled below, file borrow ends first
                dest_dir: PathBuf::new(),
                filename: file.filename.clone(),
                articles: file
                    .articles
                    .iter()
                    .map(|a| {
                        (
                            a.part_number,
                            a.result_filename.clone(),
                            a.status == ArticleStatus::Finished,
                        )
                    })
                    .collect(),
                success_articles: file.success_articles,
                failed_articles: file.failed_articles,
                output_filename: file.output_filename.clone(),
                output_state: Arc::clone(&file.output_state),
            })
        } else {
            None
        };

        let nzb = &mut self.nzbs[nzb_idx];
        nzb.active_downloads = nzb.active_downloads.saturating_sub(1);
        if success {
            nzb.success_size += article_size;
            nzb.success_articles += 1;
        } else {
            nzb.failed_size += article_size;
            nzb.failed_articles += 1;
        }

        completion.map(|mut c| {
            c.nzb_name = nzb.name.clone();
            c.dest_dir = nzb.dest_dir.clone();
            c
        })
    }

    /// Apply an editor action to a set of bundles
    pub fn edit_list(&mut self, ids: &[NzbId], action: EditAction, offset: i64) {
        match action {
            EditAction::Pause => self.for_each(ids, |n| n.paused = true),
            EditAction::Resume => self.for_each(ids, |n| n.paused = false),
            EditAction::Delete => self.for_each(ids, |n| {
                n.deleted = true;
                for f in &mut n.files {
                    f.deleted = true;
                }
            }),
            EditAction::MoveOffset => self.move_by(ids, offset),
            EditAction::MoveTop => self.move_by(ids, i64::MIN),
            EditAction::MoveBottom => self.move_by(ids, i64::MAX),
            EditAction::Merge => self.merge(ids),
        }
    }

    fn for_each(&mut self, ids: &[NzbId], mut apply: impl FnMut(&mut NzbInfo)) {
        for nzb in &mut self.nzbs {
            if ids.contains(&nzb.id) {
                apply(nzb);
            }
        }
    }

    fn move_by(&mut self, ids: &[NzbId], offset: i64) {
        // Stable extraction preserves relative order of the moved set
        let mut moved = Vec::new();
        let mut kept = Vec::new();
        let mut positions = Vec::new();
        for (idx, nzb) in self.nzbs.drain(..).enumerate() {
            if ids.contains(&nzb.id) {
                positions.push(idx as i64);
                moved.push(nzb);
            } else {
                kept.push(nzb);
            }
        }
        if moved.is_empty() {
            self.nzbs = kept;
            return;
        }
        let target = match offset {
            i64::MIN => 0,
            i64::MAX => kept.len() as i64,
            delta => positions[0].saturating_add(delta).clamp(0, kept.len() as i64),
        } as usize;
        for (i, nzb) in moved.into_iter().enumerate() {
            kept.insert((target + i).min(kept.len()), nzb);
        }
        self.nzbs = kept;
    }

    /// Merge all listed bundles into the first id of the list
    fn merge(&mut self, ids: &[NzbId]) {
        let Some((&target_id, rest)) = ids.split_first() else {
            return;
        };
        let mut absorbed = Vec::new();
        self.nzbs.retain_mut(|nzb| {
            if rest.contains(&nzb.id) && nzb.id != target_id {
                absorbed.push(std::mem::replace(nzb, NzbInfo::new("", "")));
                false
            } else {
                true
            }
        });
        if let Some(target) = self.find_nzb_mut(target_id) {
            for source in absorbed {
                target.size += source.size;
                target.success_size += source.success_size;
                target.failed_size += source.failed_size;
                target.article_count += source.article_count;
                target.success_articles += source.success_articles;
                target.failed_articles += source.failed_articles;
                target.active_downloads += source.active_downloads;
                for mut file in source.files {
                    file.nzb_id = target_id;
                    target.files.push(file);
                }
                target.completed_files.extend(source.completed_files);
            }
        }
    }

    fn locate_file(&mut self, file_id: FileId) -> Option<(usize, &mut FileInfo)> {
        let idx = self
            .nzbs
            .iter()
            .position(|n| n.files.iter().any(|f| f.id == file_id))?;
        let file = self.nzbs[idx].file_mut(file_id)?;
        Some((idx, file))
    }
}
