//! Par-repair coordination
//!
//! When a bundle finishes downloading, it enters the post-download
//! pipeline: `Queued → LoadingPars → VerifyingSources → (Repairing →
//! VerifyingRepaired)? → Finished | Failed`. When verification reports
//! missing blocks, [`ParCoordinator::request_more_blocks`] unpauses
//! additional recovery files from the same bundle — closest fit first —
//! and the pipeline resumes once they download.

mod handler;

pub use handler::{NoOpParityHandler, ParityCapabilities, ParityHandler, RepairOutcome, VerifyOutcome};

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::queue::persistence::{PostSnapshot, QueuePersistence};
use crate::queue::DownloadQueue;
use crate::types::{Event, NzbId, PostStage};

/// Fallback poll interval while waiting for recovery downloads
const WAIT_POLL: Duration = Duration::from_millis(250);

/// Drives the post-download pipeline for finished bundles
pub struct ParCoordinator {
    config: Arc<Config>,
    queue: Arc<Mutex<DownloadQueue>>,
    event_tx: broadcast::Sender<Event>,
    parity: Arc<dyn ParityHandler>,
    persistence: Arc<dyn QueuePersistence>,
    post_queue: Mutex<VecDeque<NzbId>>,
    /// Signalled whenever the download queue shape changes; the repair
    /// waiter uses it as its condition variable
    queue_changed: Notify,
    /// Signalled when a bundle enters the post queue
    post_added: Notify,
}

impl ParCoordinator {
    pub(crate) fn new(
        config: Arc<Config>,
        queue: Arc<Mutex<DownloadQueue>>,
        event_tx: broadcast::Sender<Event>,
        parity: Arc<dyn ParityHandler>,
        persistence: Arc<dyn QueuePersistence>,
    ) -> Self {
        Self {
            config,
            queue,
            event_tx,
            parity,
            persistence,
            post_queue: Mutex::new(VecDeque::new()),
            queue_changed: Notify::new(),
            post_added: Notify::new(),
        }
    }

    /// Hand a finished bundle to the pipeline
    pub async fn enqueue(&self, id: NzbId) {
        {
            let mut post_queue = self.post_queue.lock().await;
            if post_queue.contains(&id) {
                return;
            }
            post_queue.push_back(id);
        }
        self.save_post_queue().await;
        self.post_added.notify_waiters();
    }

    /// Signal that the queue shape changed (files completed, unpaused,
    /// deleted); wakes a pipeline waiting on recovery downloads
    pub fn queue_changed(&self) {
        self.queue_changed.notify_waiters();
    }

    /// Pipeline task: processes one bundle at a time until stopped
    pub(crate) async fn run(self: Arc<Self>, stop: CancellationToken) {
        loop {
            let next = { self.post_queue.lock().await.pop_front() };
            let Some(id) = next else {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = self.post_added.notified() => continue,
                    // re-check periodically; an enqueue racing the pop above
                    // would otherwise be missed
                    _ = tokio::time::sleep(Duration::from_millis(500)) => continue,
                }
            };

            let final_stage = self.run_post(id, &stop).await;
            self.set_stage(id, final_stage).await;
            self.save_post_queue().await;

            // Release the bundle from the queue now that the pipeline is done
            let removed = { self.queue.lock().await.remove_nzb(id).is_some() };
            if removed {
                self.event_tx.send(Event::NzbRemoved { id }).ok();
            }
            if stop.is_cancelled() {
                return;
            }
        }
    }

    /// One bundle's pipeline; returns the terminal stage
    async fn run_post(&self, id: NzbId, stop: &CancellationToken) -> PostStage {
        self.set_stage(id, PostStage::LoadingPars).await;

        let (nzb_name, par_file) = {
            let queue = self.queue.lock().await;
            let Some(nzb) = queue.find_nzb(id) else {
                return PostStage::Failed {
                    reason: "bundle vanished from the queue".into(),
                };
            };
            (nzb.name.clone(), main_par_file(&nzb.completed_files))
        };

        let caps = self.parity.capabilities();
        let Some(par_file) = par_file else {
            debug!(nzb = %nzb_name, "no par files, skipping verification");
            return PostStage::Finished;
        };
        if !self.config.par.par_check || !caps.can_verify {
            debug!(
                nzb = %nzb_name,
                handler = self.parity.name(),
                "par-check disabled or unavailable, skipping verification"
            );
            return PostStage::Finished;
        }

        self.set_stage(id, PostStage::VerifyingSources).await;
        let verify = match self.parity.verify(&par_file).await {
            Ok(v) => v,
            Err(e) => {
                return PostStage::Failed {
                    reason: format!("verification failed: {e}"),
                }
            }
        };
        if verify.complete {
            info!(nzb = %nzb_name, "verification successful, repair not needed");
            return PostStage::Finished;
        }
        if !caps.can_repair {
            return PostStage::Failed {
                reason: "damaged and repair is not available".into(),
            };
        }

        if verify.blocks_needed > verify.recovery_blocks_available {
            let missing = verify.blocks_needed - verify.recovery_blocks_available;
            let par_filename = par_file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let found = self.request_more_blocks(id, &par_filename, missing).await;
            if found < missing {
                return PostStage::Failed {
                    reason: format!(
                        "need {missing} more recovery blocks, only {found} queued"
                    ),
                };
            }
            info!(nzb = %nzb_name, blocks = found, "waiting for recovery files");
            if !self.wait_for_downloads(id, stop).await {
                return PostStage::Failed {
                    reason: "cancelled while waiting for recovery files".into(),
                };
            }
        }

        self.set_stage(id, PostStage::Repairing).await;
        match self.parity.repair(&par_file).await {
            Ok(repair) if repair.success => {}
            Ok(repair) => {
                return PostStage::Failed {
                    reason: repair.error.unwrap_or_else(|| "repair failed".into()),
                }
            }
            Err(e) => {
                return PostStage::Failed {
                    reason: format!("repair failed: {e}"),
                }
            }
        }

        self.set_stage(id, PostStage::VerifyingRepaired).await;
        match self.parity.verify(&par_file).await {
            Ok(v) if v.complete => {
                info!(nzb = %nzb_name, "repair successful");
                PostStage::Finished
            }
            Ok(_) => PostStage::Failed {
                reason: "still damaged after repair".into(),
            },
            Err(e) => PostStage::Failed {
                reason: format!("verification after repair failed: {e}"),
            },
        }
    }

    /// Unpause additional recovery files from the bundle until
    /// `blocks_needed` blocks are queued. Two passes: closest fit at or
    /// below the need first, then the largest remaining files.
    ///
    /// Returns the number of blocks made available by unpausing. Called by
    /// the pipeline itself and by external repair engines.
    pub async fn request_more_blocks(
        &self,
        nzb_id: NzbId,
        par_filename: &str,
        blocks_needed: u32,
    ) -> u32 {
        let mut queue = self.queue.lock().await;
        let Some(nzb) = queue.find_nzb_mut(nzb_id) else {
            return 0;
        };
        let Some((main_base, _)) = parse_par_filename(par_filename) else {
            warn!(par = par_filename, "could not parse par filename");
            return 0;
        };

        // Candidate recovery files: paused, carrying blocks, same collection
        let mut candidates: Vec<(usize, u32)> = Vec::new();
        let mut strict: Vec<(usize, u32)> = Vec::new();
        for (idx, file) in nzb.files.iter().enumerate() {
            if !file.paused || file.deleted {
                continue;
            }
            let Some((base, blocks)) = parse_par_filename(&file.filename) else {
                continue;
            };
            if blocks == 0 {
                continue;
            }
            if base == main_base {
                strict.push((idx, blocks));
            } else if base.starts_with(&main_base) {
                candidates.push((idx, blocks));
            }
        }
        let mut pool = if !strict.is_empty() {
            strict
        } else if !self.config.par.strict_par_name {
            candidates
        } else {
            Vec::new()
        };

        // When the queue cannot cover the need there is no point waking
        // any volume; report what exists and let the caller give up
        let total_available: u32 = pool.iter().map(|(_, blocks)| *blocks).sum();
        if total_available < blocks_needed {
            return total_available;
        }

        let mut need = blocks_needed as i64;
        let mut unpaused_blocks = 0u32;
        let unpause = |nzb: &mut crate::queue::NzbInfo, idx: usize, blocks: u32| {
            let file = &mut nzb.files[idx];
            if file.paused {
                info!(
                    nzb = %nzb.name,
                    file = %file.filename,
                    blocks,
                    "unpausing for par-recovery"
                );
                file.paused = false;
            }
        };

        // Pass 1: the largest file at or below the need, repeatedly. With
        // an exponentially built par set this selects the exact block
        // count requested.
        while need > 0 {
            let best = pool
                .iter()
                .enumerate()
                .filter(|(_, (_, blocks))| (*blocks as i64) <= need)
                .max_by_key(|(_, (_, blocks))| *blocks)
                .map(|(pos, _)| pos);
            let Some(pos) = best else {
                break;
            };
            let (idx, blocks) = pool.remove(pos);
            unpause(nzb, idx, blocks);
            need -= blocks as i64;
            unpaused_blocks += blocks;
        }

        // Pass 2: still short — take the largest remaining files. Only
        // needed when the par set is irregular or partially missing.
        while need > 0 {
            let best = pool
                .iter()
                .enumerate()
                .max_by_key(|(_, (_, blocks))| *blocks)
                .map(|(pos, _)| pos);
            let Some(pos) = best else {
                break;
            };
            let (idx, blocks) = pool.remove(pos);
            unpause(nzb, idx, blocks);
            need -= blocks as i64;
            unpaused_blocks += blocks;
        }

        if unpaused_blocks > 0 {
            self.event_tx
                .send(Event::RecoveryUnpaused {
                    id: nzb_id,
                    blocks_needed,
                    blocks_found: unpaused_blocks,
                })
                .ok();
        }
        drop(queue);
        self.queue_changed.notify_waiters();
        unpaused_blocks
    }

    /// Wait until the bundle is complete again (the unpaused recovery
    /// files finished downloading). Returns false when stopped.
    async fn wait_for_downloads(&self, id: NzbId, stop: &CancellationToken) -> bool {
        loop {
            {
                let queue = self.queue.lock().await;
                match queue.find_nzb(id) {
                    Some(nzb) if nzb.ready_for_post() => return true,
                    Some(_) => {}
                    None => return false,
                }
            }
            tokio::select! {
                _ = stop.cancelled() => return false,
                _ = self.queue_changed.notified() => {}
                _ = tokio::time::sleep(WAIT_POLL) => {}
            }
        }
    }

    async fn set_stage(&self, id: NzbId, stage: PostStage) {
        {
            let mut queue = self.queue.lock().await;
            if let Some(nzb) = queue.find_nzb_mut(id) {
                nzb.post_stage = stage.clone();
            }
        }
        self.event_tx
            .send(Event::PostStageChanged { id, stage })
            .ok();
    }

    async fn save_post_queue(&self) {
        let entries: Vec<PostSnapshot> = {
            let post_queue = self.post_queue.lock().await;
            let queue = self.queue.lock().await;
            post_queue
                .iter()
                .filter_map(|&nzb_id| {
                    queue.find_nzb(nzb_id).map(|n| PostSnapshot {
                        nzb_id,
                        stage: n.post_stage.clone(),
                    })
                })
                .collect()
        };
        if let Err(e) = self.persistence.save_post_queue(&entries).await {
            warn!(error = %e, "saving post queue failed");
        }
    }
}

/// Pick the main par file from the assembled outputs: a `.par2` without a
/// block-carrying `.vol` suffix wins, any par file is the fallback
fn main_par_file(completed: &[PathBuf]) -> Option<PathBuf> {
    let mut fallback = None;
    for path in completed {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        match parse_par_filename(name) {
            Some((_, 0)) => return Some(path.clone()),
            Some((_, _)) if fallback.is_none() => fallback = Some(path.clone()),
            _ => {}
        }
    }
    fallback
}

/// Parse `<base>.par2` / `<base>.vol<start>+<count>.par2` (case-insensitive;
/// `-` is accepted in place of `+`). Returns the lowercase base name and the
/// block count (0 for the index file).
pub(crate) fn parse_par_filename(name: &str) -> Option<(String, u32)> {
    let lower = name.to_lowercase();
    // trim anything after the last ".par2" occurrence
    let end = lower.rfind(".par2")? + ".par2".len();
    let stem = lower[..end].strip_suffix(".par2")?;

    let mut base = stem.to_string();
    let mut blocks = 0;
    if let Some(dot) = base.rfind('.') {
        if base[dot..].starts_with(".vol") {
            let vol = &base[dot + 4..];
            if let Some(sep) = vol.find(['+', '-']) {
                if let Ok(count) = vol[sep + 1..].parse::<u32>() {
                    blocks = count;
                    base.truncate(dot);
                }
            }
        }
    }
    Some((base, blocks))
}
