//! Worker pool and article completion handling
//!
//! Each worker task drains the queue: snapshot the next eligible article
//! under the queue lock, drive the article downloader with no lock held,
//! then fold the outcome back into the queue. The worker that completes a
//! file's last article also assembles the file and, when the bundle is
//! done, hands it to the par coordinator.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::article::{self, ArticleContext, DownloadResult};
use super::{assembler, EngineInner};
use crate::queue::ArticleTask;
use crate::types::{ArticleOutcome, Event, PostStage};

/// Idle poll interval when the queue has nothing eligible
const IDLE_POLL: Duration = Duration::from_millis(100);

/// Spawn the configured number of worker tasks
pub(crate) fn spawn_workers(inner: &Arc<EngineInner>) -> Vec<tokio::task::JoinHandle<()>> {
    (0..inner.config.download.workers)
        .map(|worker| {
            let inner = Arc::clone(inner);
            tokio::spawn(async move {
                debug!(worker, "download worker started");
                worker_loop(inner).await;
                debug!(worker, "download worker stopped");
            })
        })
        .collect()
}

async fn worker_loop(inner: Arc<EngineInner>) {
    let ctx = ArticleContext {
        pool: Arc::clone(&inner.pool),
        config: Arc::clone(&inner.config),
        speed: inner.speed.clone(),
        stop: inner.stop.clone(),
        paused: Arc::clone(&inner.paused),
    };

    while !inner.stop.is_cancelled() {
        if ctx_paused(&inner) {
            tokio::time::sleep(IDLE_POLL).await;
            continue;
        }

        let task = {
            let mut queue = inner.queue.lock().await;
            queue.dispatch_next(inner.config.download.max_active_per_file)
        };
        let Some(task) = task else {
            tokio::time::sleep(IDLE_POLL).await;
            continue;
        };

        let result = article::download_article(&ctx, &task).await;
        article_finished(&inner, task, result).await;
    }
}

fn ctx_paused(inner: &EngineInner) -> bool {
    inner.paused.load(std::sync::atomic::Ordering::Relaxed)
}

/// Fold one article outcome back into the queue and drive the follow-ups:
/// file assembly, health enforcement, bundle completion.
pub(crate) async fn article_finished(
    inner: &Arc<EngineInner>,
    task: ArticleTask,
    result: DownloadResult,
) {
    if result.outcome == ArticleOutcome::Retry {
        // Pause or stop mid-flight: no counters move, the article goes
        // back to the head of its file
        let mut queue = inner.queue.lock().await;
        queue.requeue_article(task.file_id, task.part_number);
        return;
    }

    let success = result.outcome == ArticleOutcome::Finished;
    let critical_health = inner.config.download.critical_health;

    let (completion, health_deleted) = {
        let mut queue = inner.queue.lock().await;

        // A decoder-provided filename beats the subject-derived guess
        if let Some(name) = &result.article_filename {
            if let Some(nzb) = queue.find_nzb_mut(task.nzb_id) {
                if let Some(file) = nzb.files.iter_mut().find(|f| f.id == task.file_id) {
                    if !file.filename_confirmed {
                        debug!(old = %file.filename, new = %name, "filename confirmed by article");
                        file.filename = name.clone();
                        file.filename_confirmed = true;
                    }
                }
            }
        }

        let completion = queue.finish_article(task.file_id, task.part_number, success);

        let mut health_deleted = None;
        if !success {
            inner
                .event_tx
                .send(Event::ArticleFailed {
                    file_id: task.file_id,
                    message_id: task.message_id.clone(),
                })
                .ok();

            if critical_health > 0 {
                if let Some(nzb) = queue.find_nzb_mut(task.nzb_id) {
                    let health = nzb.health();
                    if health < critical_health && !nzb.deleted {
                        warn!(
                            nzb = %nzb.name,
                            health,
                            critical = critical_health,
                            "health below critical mark, deleting bundle"
                        );
                        nzb.deleted = true;
                        for file in &mut nzb.files {
                            file.deleted = true;
                        }
                        health_deleted = Some(health);
                    }
                }
            }
        }
        (completion, health_deleted)
    };

    if let Some(health) = health_deleted {
        inner
            .event_tx
            .send(Event::NzbHealthDeleted {
                id: task.nzb_id,
                health,
            })
            .ok();
    }

    let Some(completion) = completion else {
        // Not the file's last article; recovery waiters may still care
        inner.par.queue_changed();
        return;
    };

    let bundle_deleted = {
        let queue = inner.queue.lock().await;
        queue
            .find_nzb(task.nzb_id)
            .map(|n| n.deleted)
            .unwrap_or(true)
    };
    if bundle_deleted {
        // Nothing downstream wants the file; drop its article temp files
        // and release the bundle once the last worker lets go
        for (_, result_filename, _) in &completion.articles {
            let _ = std::fs::remove_file(result_filename);
        }
        let release = {
            let mut queue = inner.queue.lock().await;
            let idle = queue
                .find_nzb(task.nzb_id)
                .map(|n| n.active_downloads == 0)
                .unwrap_or(false);
            if idle {
                queue.remove_nzb(task.nzb_id);
            }
            idle
        };
        if release {
            inner
                .event_tx
                .send(Event::NzbRemoved { id: task.nzb_id })
                .ok();
        }
        inner.par.queue_changed();
        return;
    }

    // The last article of the file is terminal: assemble outside the lock
    let assembled = assembler::complete_file(&inner.config, &completion).await;

    let bundle_complete = {
        let mut queue = inner.queue.lock().await;
        let mut bundle_complete = None;
        if let Some(nzb) = queue.find_nzb_mut(task.nzb_id) {
            nzb.completed_files.push(assembled.path.clone());
            inner
                .event_tx
                .send(Event::FileCompleted {
                    id: task.nzb_id,
                    file_id: task.file_id,
                    filename: completion.filename.clone(),
                    broken: assembled.broken,
                })
                .ok();

            if nzb.ready_for_post() && nzb.post_stage == PostStage::Queued {
                info!(
                    nzb = %nzb.name,
                    failed = nzb.failed_articles,
                    total = nzb.article_count,
                    "bundle finished downloading"
                );
                bundle_complete = Some((nzb.failed_articles, nzb.article_count));
            }
        }
        bundle_complete
    };

    // Persist before handing the bundle to the par pipeline; the pipeline
    // may release it from the queue at any point after enqueue
    inner.save_queue().await;

    if let Some((articles_failed, articles_total)) = bundle_complete {
        inner
            .event_tx
            .send(Event::NzbComplete {
                id: task.nzb_id,
                articles_failed,
                articles_total,
            })
            .ok();
        inner.par.enqueue(task.nzb_id).await;
    }

    inner.par.queue_changed();
}
