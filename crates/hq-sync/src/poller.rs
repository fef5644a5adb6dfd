//! The poll cycle: list → diff → download → delete policy → persist.

use bytes::Bytes;
use metrics::counter;
use std::collections::BTreeMap;
use std::fs::FileTimes;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::errors::{Result, SyncError};
use crate::ignore::{DEFAULT_RULES, IgnoreRules};
use crate::object_store::{ObjectStore, RemoteObject};
use crate::state::{IGNORE_FILE_NAME, STATE_FILE_NAME, SyncState, SyncStateEntry};

/// What to do with a local file whose remote counterpart disappeared.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeletedFilePolicy {
    /// Leave the local file in place.
    #[default]
    Keep,
    /// Move it into the trash directory.
    Trash,
    /// Unlink it.
    Delete,
}

impl std::str::FromStr for DeletedFilePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "keep" => Ok(Self::Keep),
            "trash" => Ok(Self::Trash),
            "delete" => Ok(Self::Delete),
            other => Err(format!("unknown deleted-file policy: {other}")),
        }
    }
}

/// Poller configuration.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Owning user (recorded in the state file).
    pub user_id: String,
    /// Remote key prefix to mirror.
    pub remote_prefix: String,
    /// Local mirror root.
    pub local_dir: PathBuf,
    /// Interval between poll cycles.
    pub poll_interval: Duration,
    /// Concurrent download limit.
    pub concurrency: usize,
    /// Deleted-file handling.
    pub deleted_file_policy: DeletedFilePolicy,
    /// State file location; defaults to `<localDir>/.hq-sync-state.json`.
    pub state_file_path: PathBuf,
    /// Trash directory for [`DeletedFilePolicy::Trash`].
    pub trash_dir: PathBuf,
    /// Extra ignore patterns appended after `.hqignore`.
    pub exclude_patterns: Vec<String>,
    /// Pagination cap per cycle.
    pub max_list_pages: usize,
    /// Mirror remote `lastModified` onto downloaded files.
    pub preserve_timestamps: bool,
}

impl SyncConfig {
    /// Reasonable defaults rooted at `local_dir`.
    pub fn new(
        user_id: impl Into<String>,
        remote_prefix: impl Into<String>,
        local_dir: impl Into<PathBuf>,
    ) -> Self {
        let local_dir = local_dir.into();
        Self {
            user_id: user_id.into(),
            remote_prefix: remote_prefix.into(),
            state_file_path: local_dir.join(STATE_FILE_NAME),
            trash_dir: local_dir.join(".hq-trash"),
            local_dir,
            poll_interval: Duration::from_secs(30),
            concurrency: 5,
            deleted_file_policy: DeletedFilePolicy::Keep,
            exclude_patterns: Vec::new(),
            max_list_pages: 20,
            preserve_timestamps: true,
        }
    }
}

/// In-process poller events, observable via [`SyncPoller::subscribe`].
#[derive(Clone, Debug)]
pub enum SyncEvent {
    /// A cycle was requested while one was running.
    PollSkipped,
    /// A new or changed remote object was detected.
    ChangeDetected {
        /// Relative path of the changed file.
        path: String,
    },
    /// A file finished downloading.
    FileDownloaded {
        /// Relative path of the downloaded file.
        path: String,
    },
    /// The delete policy was applied to a vanished file.
    FileDeleted {
        /// Relative path of the deleted file.
        path: String,
    },
    /// A cycle completed.
    PollComplete {
        /// Cycle counters.
        summary: PollSummary,
    },
    /// A cycle aborted (listing failure).
    Error {
        /// Description of the failure.
        message: String,
    },
}

/// Counters for one poll cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PollSummary {
    /// Whether the cycle ran to completion.
    pub success: bool,
    /// Whether the cycle was skipped because one was already running.
    pub skipped: bool,
    /// New/changed remote objects detected.
    pub changes_detected: usize,
    /// Files downloaded.
    pub files_downloaded: usize,
    /// Vanished files processed by the delete policy.
    pub files_deleted: usize,
    /// Per-file failures.
    pub errors: usize,
}

/// Mirrors one object-store prefix into one local directory.
pub struct SyncPoller {
    store: Arc<dyn ObjectStore>,
    config: SyncConfig,
    state: tokio::sync::Mutex<SyncState>,
    poll_gate: tokio::sync::Mutex<()>,
    events: broadcast::Sender<SyncEvent>,
    running: AtomicBool,
    cancel: parking_lot::Mutex<Option<CancellationToken>>,
}

impl SyncPoller {
    /// Create a poller, loading any existing state file.
    pub fn new(store: Arc<dyn ObjectStore>, config: SyncConfig) -> Result<Self> {
        let state = SyncState::load(
            &config.state_file_path,
            &config.user_id,
            &config.remote_prefix,
        )?;
        let (events, _) = broadcast::channel(256);
        Ok(Self {
            store,
            config,
            state: tokio::sync::Mutex::new(state),
            poll_gate: tokio::sync::Mutex::new(()),
            events,
            running: AtomicBool::new(false),
            cancel: parking_lot::Mutex::new(None),
        })
    }

    /// Subscribe to poller events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    /// Number of entries currently tracked.
    pub async fn tracked_files(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    /// Start the interval loop. Idempotent: a second call while running is
    /// a no-op.
    pub fn start_polling(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("poller already running");
            return;
        }
        let token = CancellationToken::new();
        *self.cancel.lock() = Some(token.clone());
        let poller = Arc::clone(self);
        drop(tokio::spawn(async move {
            let mut interval = tokio::time::interval(poller.config.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = token.cancelled() => {
                        info!("poller stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        if let Err(e) = poller.poll_once().await {
                            warn!(error = %e, "poll cycle failed");
                        }
                    }
                }
            }
        }));
        info!(prefix = %self.config.remote_prefix, "poller started");
    }

    /// Stop the interval loop. The in-flight cycle, if any, finishes;
    /// no further cycles start. Idempotent.
    pub fn stop_polling(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(token) = self.cancel.lock().take() {
            token.cancel();
        }
    }

    /// Clear in-memory and on-disk state.
    pub async fn reset_state(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        *state = SyncState::new(&self.config.user_id, &self.config.remote_prefix);
        state.save(&self.config.state_file_path)
    }

    /// Run one poll cycle.
    ///
    /// Skips (emitting [`SyncEvent::PollSkipped`]) when a cycle is already
    /// in flight. A listing failure aborts the cycle, emits
    /// [`SyncEvent::Error`], and leaves state untouched; per-file download
    /// failures only increment `errors`.
    #[instrument(skip(self), fields(prefix = %self.config.remote_prefix))]
    pub async fn poll_once(&self) -> Result<PollSummary> {
        let Ok(_gate) = self.poll_gate.try_lock() else {
            self.emit(SyncEvent::PollSkipped);
            counter!("sync_polls_skipped_total").increment(1);
            return Ok(PollSummary {
                success: true,
                skipped: true,
                ..PollSummary::default()
            });
        };

        let remote = match self.list_remote().await {
            Ok(remote) => remote,
            Err(e) => {
                self.emit(SyncEvent::Error {
                    message: e.to_string(),
                });
                counter!("sync_poll_errors_total").increment(1);
                return Err(e);
            }
        };

        let ignore = self.load_ignore_rules()?;
        let mut summary = PollSummary::default();

        // Diff against the state cache.
        let (changed, deleted) = {
            let state = self.state.lock().await;
            let mut changed: Vec<(String, RemoteObject)> = Vec::new();
            for (rel, object) in &remote {
                if ignore.is_ignored(rel, false) {
                    continue;
                }
                let in_sync = state
                    .entries
                    .get(rel)
                    .is_some_and(|entry| entry.etag == object.etag);
                if !in_sync {
                    changed.push((rel.clone(), object.clone()));
                }
            }
            let deleted: Vec<String> = state
                .entries
                .keys()
                .filter(|rel| !remote.contains_key(*rel))
                .cloned()
                .collect();
            (changed, deleted)
        };

        summary.changes_detected = changed.len();
        for (rel, _) in &changed {
            self.emit(SyncEvent::ChangeDetected { path: rel.clone() });
        }

        // Bounded-concurrency downloads.
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks: JoinSet<std::result::Result<(String, RemoteObject), SyncError>> =
            JoinSet::new();
        for (rel, object) in changed {
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|_| SyncError::Cancelled)?;
            let store = Arc::clone(&self.store);
            let target = self.config.local_dir.join(&rel);
            let preserve = self.config.preserve_timestamps;
            let _ = tasks.spawn(async move {
                let _permit = permit;
                let body = store.get(&object.key).await?;
                write_atomic(&target, &body, preserve.then_some(object.last_modified_ms))
                    .await
                    .map_err(|e| SyncError::Download {
                        key: object.key.clone(),
                        message: e.to_string(),
                    })?;
                Ok((rel, object))
            });
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok((rel, object))) => {
                    let mut state = self.state.lock().await;
                    let _ = state.entries.insert(
                        rel.clone(),
                        SyncStateEntry {
                            relative_path: rel.clone(),
                            last_modified: object.last_modified_ms,
                            etag: object.etag,
                            size: object.size,
                            synced_at: now_ms(),
                        },
                    );
                    drop(state);
                    counter!("sync_files_downloaded_total").increment(1);
                    summary.files_downloaded += 1;
                    self.emit(SyncEvent::FileDownloaded { path: rel });
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "download failed");
                    counter!("sync_download_errors_total").increment(1);
                    summary.errors += 1;
                }
                Err(join_err) => {
                    warn!(error = %join_err, "download task panicked");
                    summary.errors += 1;
                }
            }
        }

        // Delete policy for vanished files.
        for rel in deleted {
            match self.apply_delete_policy(&rel) {
                Ok(()) => {
                    let mut state = self.state.lock().await;
                    let _ = state.entries.remove(&rel);
                    drop(state);
                    counter!("sync_files_deleted_total").increment(1);
                    summary.files_deleted += 1;
                    self.emit(SyncEvent::FileDeleted { path: rel });
                }
                Err(e) => {
                    warn!(path = %rel, error = %e, "delete policy failed");
                    summary.errors += 1;
                }
            }
        }

        // Persist state atomically.
        {
            let mut state = self.state.lock().await;
            state.last_poll_at = Some(now_ms());
            state.save(&self.config.state_file_path)?;
        }

        summary.success = true;
        debug!(
            changes = summary.changes_detected,
            downloaded = summary.files_downloaded,
            deleted = summary.files_deleted,
            errors = summary.errors,
            "poll complete"
        );
        self.emit(SyncEvent::PollComplete { summary });
        Ok(summary)
    }

    /// List all pages under the prefix, keyed by relative path.
    async fn list_remote(&self) -> Result<BTreeMap<String, RemoteObject>> {
        let mut remote = BTreeMap::new();
        let mut token: Option<String> = None;
        for _ in 0..self.config.max_list_pages.max(1) {
            let page = self
                .store
                .list_page(&self.config.remote_prefix, token.as_deref())
                .await?;
            for object in page.objects {
                let Some(rel) = object.key.strip_prefix(&self.config.remote_prefix) else {
                    continue;
                };
                let rel = rel.trim_start_matches('/');
                // Directory markers and the poller's own files never sync.
                if rel.is_empty()
                    || rel.ends_with('/')
                    || rel == STATE_FILE_NAME
                    || rel == IGNORE_FILE_NAME
                {
                    continue;
                }
                let _ = remote.insert(rel.to_string(), object);
            }
            token = page.next_token;
            if token.is_none() {
                break;
            }
        }
        Ok(remote)
    }

    fn load_ignore_rules(&self) -> Result<Arc<IgnoreRules>> {
        let mut text = DEFAULT_RULES.join("\n");
        let ignore_path = self.config.local_dir.join(IGNORE_FILE_NAME);
        if let Ok(user_rules) = std::fs::read_to_string(&ignore_path) {
            text.push('\n');
            text.push_str(&user_rules);
        }
        for pattern in &self.config.exclude_patterns {
            text.push('\n');
            text.push_str(pattern);
        }
        IgnoreRules::cached(&text)
    }

    fn apply_delete_policy(&self, rel: &str) -> Result<()> {
        let target = self.config.local_dir.join(rel);
        match self.config.deleted_file_policy {
            DeletedFilePolicy::Keep => Ok(()),
            DeletedFilePolicy::Trash => {
                if target.exists() {
                    let trashed = self.config.trash_dir.join(rel);
                    if let Some(parent) = trashed.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::rename(&target, &trashed)?;
                }
                Ok(())
            }
            DeletedFilePolicy::Delete => {
                if target.exists() {
                    std::fs::remove_file(&target)?;
                }
                Ok(())
            }
        }
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Write `body` to `target` via temp-file + rename, optionally pinning the
/// modification time.
async fn write_atomic(target: &Path, body: &Bytes, mtime_ms: Option<i64>) -> std::io::Result<()> {
    let target = target.to_path_buf();
    let body = body.clone();
    tokio::task::spawn_blocking(move || {
        let parent = target
            .parent()
            .ok_or_else(|| std::io::Error::other("target has no parent"))?;
        std::fs::create_dir_all(parent)?;
        let mut temp = tempfile::NamedTempFile::new_in(parent)?;
        temp.write_all(&body)?;
        temp.flush()?;
        if let Some(ms) = mtime_ms {
            if ms > 0 {
                let mtime = UNIX_EPOCH + Duration::from_millis(ms as u64);
                temp.as_file()
                    .set_times(FileTimes::new().set_modified(mtime))?;
            }
        }
        let _ = temp
            .persist(&target)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        Ok(())
    })
    .await
    .map_err(|e| std::io::Error::other(e.to_string()))?
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
