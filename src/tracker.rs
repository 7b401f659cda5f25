//! The watch-progress orchestrator.
//!
//! [`ProgressTracker`] is the only writer of the local table. Every mutation
//! is a synchronous read-modify-write against the [`LocalStore`], followed by
//! a change broadcast and, when a user is signed in, a queued remote push.
//! Remote work never blocks or rolls back a local write.

use chrono::Utc;
use std::sync::{
    Arc, Mutex, RwLock,
    atomic::{AtomicBool, Ordering},
};
use tokio::{
    runtime::Handle,
    sync::{broadcast, mpsc, oneshot},
};
use tracing::{debug, error, info, warn};

use crate::events::{
    self, EventBus, InboundMessage, ListenerId, OriginAllowList, PlayerEvent, PlayerInbox,
    ProgressUpdated,
};
use crate::history::LocalStore;
use crate::remote::{self, DocumentStore, RemoteSync, SyncJob, merge_tables};
use crate::types::{ProgressEntry, ProgressPatch, ProgressTable, TitleMetadata};

/// Episode recorded when a title is opened without an explicit episode.
pub const DEFAULT_EPISODE: u32 = 1;

pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

pub struct ProgressTracker {
    store: LocalStore,
    bus: Arc<EventBus>,
    sync: Arc<RemoteSync>,
    clock: Arc<dyn Clock>,
    user_id: RwLock<Option<String>>,
    write_lock: Mutex<()>,
    initialized: AtomicBool,
    inbox: PlayerInbox,
    inbox_rx: Mutex<Option<mpsc::UnboundedReceiver<InboundMessage>>>,
    jobs: mpsc::UnboundedSender<SyncJob>,
    jobs_rx: Mutex<Option<mpsc::UnboundedReceiver<SyncJob>>>,
}

impl ProgressTracker {
    pub fn new(
        store: LocalStore,
        remote: Arc<dyn DocumentStore>,
        allowed_origins: OriginAllowList,
    ) -> Self {
        let (inbox, inbox_rx) = PlayerInbox::channel();
        let (jobs, jobs_rx) = mpsc::unbounded_channel();
        Self {
            store,
            bus: Arc::new(EventBus::new(allowed_origins)),
            sync: Arc::new(RemoteSync::new(remote)),
            clock: Arc::new(SystemClock),
            user_id: RwLock::new(None),
            write_lock: Mutex::new(()),
            initialized: AtomicBool::new(false),
            inbox,
            inbox_rx: Mutex::new(Some(inbox_rx)),
            jobs,
            jobs_rx: Mutex::new(Some(jobs_rx)),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Starts the player listener and the push worker. Safe to call from
    /// several places; only the first call spawns anything. Outside a Tokio
    /// runtime nothing is started and a later call may retry.
    pub fn init(&self) {
        let Ok(runtime) = Handle::try_current() else {
            warn!("progress tracker init needs a Tokio runtime, not starting");
            return;
        };
        if self
            .initialized
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        if let Some(rx) = take(&self.inbox_rx) {
            runtime.spawn(events::run_listener(Arc::clone(&self.bus), rx));
        }
        if let Some(rx) = take(&self.jobs_rx) {
            runtime.spawn(remote::run_push_worker(Arc::clone(&self.sync), rx));
        }
        debug!("progress tracker initialized");
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Associates the signed-in user for dual writes. Does not merge; use
    /// [`ProgressTracker::sign_in`] for that.
    pub fn set_user_id(&self, user_id: Option<String>) {
        let mut current = self.user_id.write().unwrap_or_else(|e| e.into_inner());
        if *current != user_id {
            debug!(signed_in = user_id.is_some(), "user association changed");
        }
        *current = user_id;
    }

    pub fn user_id(&self) -> Option<String> {
        self.user_id
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_last_watched_episode(&self, title: &TitleMetadata, episode: u32) {
        let now = self.clock.now_millis();
        self.mutate(|table| {
            let entry = match table.get_mut(title.id) {
                Some(entry) => {
                    entry.title.clone_from(&title.title);
                    if !title.poster_url.is_empty() {
                        entry.poster_url.clone_from(&title.poster_url);
                    }
                    entry.last_episode_watched = episode;
                    entry.last_accessed = now;
                    entry.clone()
                }
                None => {
                    let entry = ProgressEntry::new(title, episode, now);
                    table.upsert(entry.clone());
                    entry
                }
            };
            debug!(id = title.id, episode, "last watched episode recorded");
            Some(ProgressPatch::new().upsert(entry))
        });
    }

    /// Starts tracking a title at [`DEFAULT_EPISODE`]. A title that is
    /// already tracked is left untouched.
    pub fn add_to_history(&self, title: &TitleMetadata) {
        let now = self.clock.now_millis();
        self.mutate(|table| {
            if table.contains(title.id) {
                return None;
            }
            let entry = ProgressEntry::new(title, DEFAULT_EPISODE, now);
            table.upsert(entry.clone());
            debug!(id = title.id, "title added to history");
            Some(ProgressPatch::new().upsert(entry))
        });
    }

    /// Deletes a title locally and, when signed in, remotely. The remote
    /// deletion is requested even if the title was not tracked locally.
    pub fn remove_from_history(&self, id: u64) {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut table = self.store.load();
        if table.remove(id).is_some() {
            self.persist(&table);
            debug!(id, "title removed from history");
        }
        self.queue_push(ProgressPatch::new().delete(id));
    }

    pub fn get_all_media_data(&self) -> ProgressTable {
        self.store.load()
    }

    pub fn get_media_data(&self, id: u64) -> Option<ProgressEntry> {
        self.store.load().get(id).cloned()
    }

    pub fn add_event_listener<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&PlayerEvent) + Send + Sync + 'static,
    {
        self.bus.subscribe(handler)
    }

    pub fn remove_event_listener(&self, id: ListenerId) -> bool {
        self.bus.unsubscribe(id)
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<ProgressUpdated> {
        self.bus.subscribe_updates()
    }

    pub fn player_inbox(&self) -> PlayerInbox {
        self.inbox.clone()
    }

    /// Merges local and remote progress for `user_id` and stores the result
    /// locally. Queued pushes are flushed first so earlier removals reach the
    /// remote before it is read. On failure the local table is kept as is.
    ///
    /// Local writes made while the remote calls are in flight win over the
    /// merged table and are pushed to `user_id` afterwards.
    pub async fn merge_remote(&self, user_id: &str) -> ProgressTable {
        self.flush().await;
        let snapshot = self.store.load();
        let merged = match self.sync.merge(user_id, &snapshot).await {
            Ok(merged) => merged,
            Err(err) => {
                warn!(user_id, "progress merge failed, keeping local copy: {err:#}");
                return self.store.load();
            }
        };

        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.store.load();
        let (reconciled, patch) = replay_local_writes(merged, &snapshot, &current);
        self.persist(&reconciled);
        if !patch.is_empty() {
            debug!(user_id, changes = patch.len(), "replaying writes made during merge");
            self.enqueue(SyncJob::Push {
                user_id: user_id.to_string(),
                patch,
            });
        }
        reconciled
    }

    /// Merge first, then associate, so later dual writes start from a
    /// reconciled table.
    pub async fn sign_in(&self, user_id: &str) -> ProgressTable {
        let merged = self.merge_remote(user_id).await;
        self.set_user_id(Some(user_id.to_string()));
        info!(user_id, entries = merged.len(), "signed in");
        merged
    }

    pub fn sign_out(&self) {
        self.set_user_id(None);
    }

    /// Folds an exported table into the local one; newer entries win whole.
    /// Returns how many entries changed.
    pub fn import(&self, incoming: &ProgressTable) -> usize {
        let mut changed = 0;
        self.mutate(|table| {
            let merged = merge_tables(table.clone(), incoming);
            let patch = merged
                .iter()
                .filter(|entry| table.get(entry.id) != Some(*entry))
                .cloned()
                .fold(ProgressPatch::new(), ProgressPatch::upsert);
            if patch.is_empty() {
                return None;
            }
            changed = patch.len();
            *table = merged;
            Some(patch)
        });
        changed
    }

    /// Waits until every push queued so far has been attempted. Before
    /// [`ProgressTracker::init`] the queued pushes are sent from here.
    pub async fn flush(&self) {
        match self.drain_pending() {
            Some(pending) => {
                for job in pending {
                    remote::run_job(&self.sync, job).await;
                }
            }
            None => {
                let (done, wait) = oneshot::channel();
                if self.jobs.send(SyncJob::Flush(done)).is_ok() {
                    let _ = wait.await;
                }
            }
        }
    }

    /// `None` once the push worker owns the queue.
    fn drain_pending(&self) -> Option<Vec<SyncJob>> {
        let mut slot = self.jobs_rx.lock().unwrap_or_else(|e| e.into_inner());
        let rx = slot.as_mut()?;
        let mut pending = Vec::new();
        while let Ok(job) = rx.try_recv() {
            pending.push(job);
        }
        Some(pending)
    }

    fn mutate<F>(&self, apply: F)
    where
        F: FnOnce(&mut ProgressTable) -> Option<ProgressPatch>,
    {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut table = self.store.load();
        let Some(patch) = apply(&mut table) else {
            return;
        };
        self.persist(&table);
        self.queue_push(patch);
    }

    fn persist(&self, table: &ProgressTable) {
        match self.store.save(table) {
            Ok(()) => self.bus.notify_changed(),
            Err(err) => error!(path = %self.store.path().display(), "failed to save progress: {err:#}"),
        }
    }

    fn queue_push(&self, patch: ProgressPatch) {
        let Some(user_id) = self.user_id() else {
            return;
        };
        self.enqueue(SyncJob::Push { user_id, patch });
    }

    fn enqueue(&self, job: SyncJob) {
        if self.jobs.send(job).is_err() {
            warn!("push queue closed, remote progress not updated");
        }
    }
}

/// Lays the local changes made since `snapshot` over `merged`: entries that
/// changed or appeared replace the merged ones, entries that disappeared are
/// dropped. Returns the table to keep and the patch the remote still needs.
fn replay_local_writes(
    merged: ProgressTable,
    snapshot: &ProgressTable,
    current: &ProgressTable,
) -> (ProgressTable, ProgressPatch) {
    let mut reconciled = merged;
    let mut patch = ProgressPatch::new();
    for entry in snapshot.iter() {
        if !current.contains(entry.id) && reconciled.remove(entry.id).is_some() {
            patch = patch.delete(entry.id);
        }
    }
    for entry in current.iter() {
        if snapshot.get(entry.id) != Some(entry) && reconciled.get(entry.id) != Some(entry) {
            reconciled.upsert(entry.clone());
            patch = patch.upsert(entry.clone());
        }
    }
    (reconciled, patch)
}

fn take<T>(slot: &Mutex<Option<T>>) -> Option<T> {
    slot.lock().unwrap_or_else(|e| e.into_inner()).take()
}
