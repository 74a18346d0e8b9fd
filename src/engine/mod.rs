//! The download engine: an explicit value owning the server pool, the
//! shared queue, the worker set and the par pipeline
//!
//! No global state exists — tests instantiate independent engines. All
//! fields live behind one `Arc`, so the engine clones cheaply into
//! spawned tasks; observers subscribe to a broadcast [`Event`] stream.

mod article;
mod assembler;
mod coordinator;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::nntp::ServerPool;
use crate::par::{NoOpParityHandler, ParCoordinator, ParityHandler};
use crate::queue::persistence::{NoOpPersistence, QueuePersistence, QueueSnapshot};
use crate::queue::{DownloadQueue, NzbInfo};
use crate::speed::SpeedMeter;
use crate::types::{EditAction, Event, NzbId, NzbStats};

/// Capacity of the event broadcast channel; a subscriber lagging further
/// than this sees `RecvError::Lagged`
const EVENT_CHANNEL_CAPACITY: usize = 1000;
/// How long shutdown waits for workers to observe the stop flag
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub(crate) struct EngineInner {
    pub(crate) config: Arc<Config>,
    pub(crate) pool: Arc<ServerPool>,
    pub(crate) queue: Arc<Mutex<DownloadQueue>>,
    pub(crate) event_tx: broadcast::Sender<Event>,
    pub(crate) speed: SpeedMeter,
    pub(crate) persistence: Arc<dyn QueuePersistence>,
    pub(crate) par: Arc<ParCoordinator>,
    pub(crate) paused: Arc<AtomicBool>,
    pub(crate) stop: CancellationToken,
    accepting_new: AtomicBool,
    started: AtomicBool,
    tasks: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl EngineInner {
    /// Snapshot the queue under the lock, persist outside it
    pub(crate) async fn save_queue(&self) {
        let snapshot = {
            let queue = self.queue.lock().await;
            QueueSnapshot::capture(&queue)
        };
        if let Err(e) = self.persistence.save_queue(&snapshot).await {
            warn!(error = %e, "saving queue failed");
        }
    }
}

/// The download engine (cloneable — state is shared behind an `Arc`)
#[derive(Clone)]
pub struct DownloadEngine {
    inner: Arc<EngineInner>,
}

impl DownloadEngine {
    /// Create an engine with no persistence and no repair engine
    pub async fn new(config: Config) -> Result<Self> {
        Self::with_collaborators(config, Arc::new(NoOpParityHandler), Arc::new(NoOpPersistence))
            .await
    }

    /// Create an engine with explicit collaborators.
    ///
    /// Validates the configuration, prepares the working directories,
    /// restores a previously persisted queue and wires up the server
    /// pool, event channel and par coordinator.
    pub async fn with_collaborators(
        config: Config,
        parity: Arc<dyn ParityHandler>,
        persistence: Arc<dyn QueuePersistence>,
    ) -> Result<Self> {
        config.validate()?;

        tokio::fs::create_dir_all(&config.download.dest_dir)
            .await
            .map_err(|e| Error::FileWrite {
                path: config.download.dest_dir.clone(),
                source: e,
            })?;
        tokio::fs::create_dir_all(&config.download.temp_dir)
            .await
            .map_err(|e| Error::FileWrite {
                path: config.download.temp_dir.clone(),
                source: e,
            })?;

        let queue = match persistence.load_queue().await? {
            Some(snapshot) => {
                let queue = snapshot.restore();
                info!(bundles = queue.nzbs().len(), "restored queue");
                queue
            }
            None => DownloadQueue::new(),
        };
        let queue = Arc::new(Mutex::new(queue));

        let config = Arc::new(config);
        let (event_tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let pool = Arc::new(ServerPool::new(&config));
        let speed = SpeedMeter::new(config.download.download_rate_bps);

        info!(
            servers = config.servers.len(),
            max_level = pool.max_level(),
            workers = config.download.workers,
            parity = parity.name(),
            "engine initialized"
        );

        let par = Arc::new(ParCoordinator::new(
            Arc::clone(&config),
            Arc::clone(&queue),
            event_tx.clone(),
            parity,
            Arc::clone(&persistence),
        ));

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                pool,
                queue,
                event_tx,
                speed,
                persistence,
                par,
                paused: Arc::new(AtomicBool::new(false)),
                stop: CancellationToken::new(),
                accepting_new: AtomicBool::new(true),
                started: AtomicBool::new(false),
                tasks: std::sync::Mutex::new(Vec::new()),
            }),
        })
    }

    /// Start the worker pool and the par pipeline. Idempotent.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.extend(coordinator::spawn_workers(&self.inner));
        let par = Arc::clone(&self.inner.par);
        let stop = self.inner.stop.clone();
        tasks.push(tokio::spawn(par.run(stop)));

        // Re-enqueue restored bundles that were already complete when the
        // previous process stopped
        let inner = Arc::clone(&self.inner);
        tasks.push(tokio::spawn(async move {
            let pending: Vec<NzbId> = {
                let queue = inner.queue.lock().await;
                queue
                    .nzbs()
                    .iter()
                    .filter(|n| !n.deleted && n.ready_for_post())
                    .map(|n| n.id)
                    .collect()
            };
            for id in pending {
                inner.par.enqueue(id).await;
            }
        }));
    }

    /// Graceful shutdown: stop workers, cancel in-flight connections, wait
    /// briefly, persist the queue.
    pub async fn shutdown(&self) -> Result<()> {
        info!("shutting down");
        self.inner.accepting_new.store(false, Ordering::SeqCst);
        self.inner.event_tx.send(Event::Shutdown).ok();
        self.inner.stop.cancel();
        // In-flight reads and connects unblock promptly; errors from the
        // torn-down sockets are expected and suppressed by the workers
        self.inner.pool.cancel_all();

        let tasks: Vec<_> = {
            let mut registry = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
            registry.drain(..).collect()
        };
        for task in tasks {
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                warn!("a worker did not stop within the grace period");
            }
        }
        self.inner.pool.close_idle().await;
        self.inner.save_queue().await;
        Ok(())
    }

    /// Append a bundle produced by the manifest parser to the queue.
    ///
    /// Articles are re-numbered into the engine's temp namespace; a bundle
    /// with no articles completes immediately.
    pub async fn add_nzb(&self, nzb: NzbInfo) -> Result<NzbId> {
        if !self.inner.accepting_new.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        let name = nzb.name.clone();
        let (id, already_complete) = {
            let mut queue = self.inner.queue.lock().await;
            let id = queue.add_nzb(nzb, &self.inner.config.download.temp_dir);

            // A bundle without an explicit destination goes to the
            // configured one
            if let Some(added) = queue.find_nzb_mut(id) {
                if added.dest_dir.as_os_str().is_empty() {
                    added.dest_dir = self.inner.config.download.dest_dir.clone();
                }
            }

            // Direct-write outputs live in a per-bundle staging directory
            // until assembly moves them into place
            if self.inner.config.download.direct_write {
                let staging = self
                    .inner
                    .config
                    .download
                    .temp_dir
                    .join(format!("nzb-{id}"));
                if let Some(added) = queue.find_nzb_mut(id) {
                    for file in &mut added.files {
                        file.output_filename =
                            Some(staging.join(format!("{}.out", file.id)));
                    }
                }
            }

            let already_complete = queue
                .find_nzb(id)
                .map(|n| n.download_finished())
                .unwrap_or(false);
            (id, already_complete)
        };

        info!(nzb = %name, %id, "bundle queued");
        self.inner.event_tx.send(Event::NzbAdded { id, name }).ok();

        if already_complete {
            // Zero articles: success with nothing downloaded
            self.inner
                .event_tx
                .send(Event::NzbComplete {
                    id,
                    articles_failed: 0,
                    articles_total: 0,
                })
                .ok();
            self.inner.par.enqueue(id).await;
        }
        self.inner.save_queue().await;
        Ok(id)
    }

    /// Subscribe to engine events. Multiple subscribers each receive every
    /// event; events are dropped for nobody-listening, lagged subscribers
    /// receive `RecvError::Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.event_tx.subscribe()
    }

    /// Pause dispatching; running articles re-queue at the next quantum
    pub fn pause_download(&self) {
        if !self.inner.paused.swap(true, Ordering::SeqCst) {
            debug!("download paused");
            self.inner.event_tx.send(Event::DownloadPaused).ok();
        }
    }

    /// Resume dispatching
    pub fn resume_download(&self) {
        if self.inner.paused.swap(false, Ordering::SeqCst) {
            debug!("download resumed");
            self.inner.event_tx.send(Event::DownloadResumed).ok();
        }
    }

    /// Whether dispatching is paused
    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::Relaxed)
    }

    /// Change the aggregate download rate limit (0 = unlimited)
    pub fn set_download_rate(&self, rate_bps: u64) {
        self.inner.speed.set_rate(rate_bps);
        self.inner
            .event_tx
            .send(Event::DownloadRateChanged { rate_bps })
            .ok();
    }

    /// Measured aggregate download speed over the rolling window
    pub fn current_speed_bps(&self) -> u64 {
        self.inner.speed.current_bps()
    }

    /// Lock the queue for inspection or editing. Hold briefly; never
    /// across I/O.
    pub async fn lock_queue(&self) -> MutexGuard<'_, DownloadQueue> {
        self.inner.queue.lock().await
    }

    /// Apply an editor action to a set of bundles.
    ///
    /// Deleted bundles with no article in flight are released right away;
    /// otherwise the last worker to let go releases them.
    pub async fn edit_list(&self, ids: &[NzbId], action: EditAction, offset: i64) {
        let released: Vec<NzbId> = {
            let mut queue = self.inner.queue.lock().await;
            queue.edit_list(ids, action, offset);
            if action == EditAction::Delete {
                let idle: Vec<NzbId> = ids
                    .iter()
                    .copied()
                    .filter(|&id| {
                        queue
                            .find_nzb(id)
                            .map(|n| n.active_downloads == 0)
                            .unwrap_or(false)
                    })
                    .collect();
                for &id in &idle {
                    queue.remove_nzb(id);
                }
                idle
            } else {
                Vec::new()
            }
        };
        for id in released {
            self.inner.event_tx.send(Event::NzbRemoved { id }).ok();
        }
        self.inner.par.queue_changed();
        self.inner.save_queue().await;
    }

    /// Counter snapshot for one bundle
    pub async fn nzb_stats(&self, id: NzbId) -> Option<NzbStats> {
        let queue = self.inner.queue.lock().await;
        queue.find_nzb(id).map(|n| n.stats())
    }

    /// The par coordinator, for external repair engines that call
    /// [`ParCoordinator::request_more_blocks`] directly
    pub fn par_coordinator(&self) -> Arc<ParCoordinator> {
        Arc::clone(&self.inner.par)
    }

    /// The configured destination directory
    pub fn dest_dir(&self) -> PathBuf {
        self.inner.config.download.dest_dir.clone()
    }
}
