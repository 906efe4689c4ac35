//! Durable key/value storage shared by every tab of the same origin.
//!
//! Each tab owns one storage *handle*. Writes through a handle are visible to
//! every other handle on the next read, and are announced to the other handles'
//! subscribers as [`StorageEvent`]s. A handle never receives events for its own
//! writes; callers rely on that instead of filtering manually.
//!
//! # Backends
//!
//! - [`MemoryStorage`]: an in-process hub. `MemoryStorage::tab()` opens another
//!   handle onto the same entries. Used by tests and single-process hosts.
//! - [`FileStorage`]: a JSON file shared between processes. Writes go through a
//!   lock directory and temp file + rename; a watcher task polls the file and
//!   diffs it against the handle's last-known snapshot.
//!
//! # File Format
//!
//! ```json
//! {
//!   "version": 1,
//!   "entries": { "accessToken": "...", "lastActivity": "1760000000000" }
//! }
//! ```

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use fs_err as fs;
use keystone_protocol::StorageKey;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Result, SessionError};

const EVENT_CAPACITY: usize = 64;
const STORE_VERSION: u32 = 1;
const LOCK_RETRY_DELAY_MS: u64 = 10;
const LOCK_MAX_ATTEMPTS: u32 = 200;
const STALE_LOCK_SECS: u64 = 5;

/// A change made by some *other* handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

impl StorageEvent {
    pub fn storage_key(&self) -> Option<StorageKey> {
        StorageKey::from_str(&self.key)
    }

    pub fn is_removal(&self) -> bool {
        self.old_value.is_some() && self.new_value.is_none()
    }
}

pub trait SharedStorage: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    fn remove(&self, key: &str) -> Result<()>;

    /// Events for writes made through other handles.
    fn subscribe(&self) -> broadcast::Receiver<StorageEvent>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn diff_entries(
    before: &HashMap<String, String>,
    after: &HashMap<String, String>,
) -> Vec<StorageEvent> {
    let mut events = Vec::new();
    for (key, new_value) in after {
        let old_value = before.get(key);
        if old_value != Some(new_value) {
            events.push(StorageEvent {
                key: key.clone(),
                old_value: old_value.cloned(),
                new_value: Some(new_value.clone()),
            });
        }
    }
    for (key, old_value) in before {
        if !after.contains_key(key) {
            events.push(StorageEvent {
                key: key.clone(),
                old_value: Some(old_value.clone()),
                new_value: None,
            });
        }
    }
    events.sort_by(|a, b| a.key.cmp(&b.key));
    events
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-process backend
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct MemoryHub {
    entries: Mutex<HashMap<String, String>>,
    tabs: Mutex<Vec<(u64, broadcast::Sender<StorageEvent>)>>,
    next_tab: AtomicU64,
}

/// One tab's handle onto an in-process store.
pub struct MemoryStorage {
    hub: Arc<MemoryHub>,
    tab_id: u64,
    sender: broadcast::Sender<StorageEvent>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::attach(Arc::new(MemoryHub::default()))
    }

    /// Opens another tab on the same entries.
    pub fn tab(&self) -> Self {
        Self::attach(Arc::clone(&self.hub))
    }

    pub fn tab_id(&self) -> u64 {
        self.tab_id
    }

    fn attach(hub: Arc<MemoryHub>) -> Self {
        let tab_id = hub.next_tab.fetch_add(1, Ordering::Relaxed);
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        lock(&hub.tabs).push((tab_id, sender.clone()));
        Self {
            hub,
            tab_id,
            sender,
        }
    }

    fn write(&self, key: &str, value: Option<&str>) {
        let mut entries = lock(&self.hub.entries);
        let old_value = match value {
            Some(value) => entries.insert(key.to_string(), value.to_string()),
            None => entries.remove(key),
        };
        let new_value = value.map(str::to_string);
        if old_value == new_value {
            return;
        }

        let event = StorageEvent {
            key: key.to_string(),
            old_value,
            new_value,
        };
        // Broadcast while still holding the entries lock so every tab sees
        // writes in the order they were applied.
        for (tab_id, sender) in lock(&self.hub.tabs).iter() {
            if *tab_id != self.tab_id {
                let _ = sender.send(event.clone());
            }
        }
        drop(entries);
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryStorage {
    fn drop(&mut self) {
        lock(&self.hub.tabs).retain(|(tab_id, _)| *tab_id != self.tab_id);
    }
}

impl SharedStorage for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.hub.entries).get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.write(key, Some(value));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.write(key, None);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.sender.subscribe()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// File backend
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    #[serde(default)]
    entries: HashMap<String, String>,
}

type Change = (String, Option<String>);

/// One process's handle onto a JSON store file.
///
/// A write that finds the lock free lands on disk before `set`/`remove`
/// returns. Inside a tokio runtime, a write that finds the lock held by
/// another process is queued instead and flushed by a background task that
/// waits on tokio time, so callers on the runtime never sleep a worker
/// thread. Queued values are visible to this handle's reads right away.
pub struct FileStorage {
    inner: Arc<FileInner>,
}

struct FileInner {
    path: PathBuf,
    snapshot: Mutex<HashMap<String, String>>,
    pending: Mutex<PendingWrites>,
    sender: broadcast::Sender<StorageEvent>,
}

#[derive(Default)]
struct PendingWrites {
    /// Oldest first.
    queue: Vec<Change>,
    flushing: bool,
}

impl FileStorage {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| SessionError::StorageWrite {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let entries = read_entries(path)?;
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            inner: Arc::new(FileInner {
                path: path.to_path_buf(),
                snapshot: Mutex::new(entries),
                pending: Mutex::new(PendingWrites::default()),
                sender,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Writes queued behind another process's lock and not yet on disk.
    pub fn pending_writes(&self) -> usize {
        lock(&self.inner.pending).queue.len()
    }

    /// Re-reads the file and announces entries changed by other processes.
    /// Returns the number of events emitted.
    pub fn poll_changes(&self) -> Result<usize> {
        self.inner.poll_changes()
    }

    /// Polls the file every `interval` until the returned task is aborted.
    pub fn spawn_watcher(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let storage = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = storage.poll_changes() {
                    warn!(error = %err, "Failed to poll shared storage");
                }
            }
        })
    }

    fn write(&self, key: &str, value: Option<&str>) -> Result<()> {
        let change = (key.to_string(), value.map(str::to_string));
        let mut pending = lock(&self.inner.pending);

        // Queued writes go first, so a new write may only skip the queue when
        // it is empty.
        if pending.queue.is_empty() {
            if let Some(_guard) = WriteLock::try_acquire(&self.inner.path)? {
                return self.inner.apply(&[change]);
            }
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                pending.queue.push(change);
                if !pending.flushing {
                    pending.flushing = true;
                    debug!(path = %self.inner.path.display(), "Storage lock busy; deferring write");
                    runtime.spawn(flush_pending(Arc::clone(&self.inner)));
                }
                Ok(())
            }
            Err(_) => {
                let _guard = WriteLock::acquire_blocking(&self.inner.path)?;
                pending.queue.push(change);
                let changes = std::mem::take(&mut pending.queue);
                self.inner.apply(&changes)
            }
        }
    }
}

impl SharedStorage for FileStorage {
    fn get(&self, key: &str) -> Option<String> {
        let pending = lock(&self.inner.pending);
        if let Some((_, value)) = pending.queue.iter().rev().find(|(queued, _)| queued == key) {
            return value.clone();
        }
        drop(pending);

        match read_entries(&self.inner.path) {
            Ok(entries) => entries.get(key).cloned(),
            Err(err) => {
                warn!(error = %err, "Failed to read shared storage; using last snapshot");
                lock(&self.inner.snapshot).get(key).cloned()
            }
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.write(key, Some(value))
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.write(key, None)
    }

    fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.inner.sender.subscribe()
    }
}

impl FileInner {
    fn poll_changes(&self) -> Result<usize> {
        let mut snapshot = lock(&self.snapshot);
        let current = read_entries(&self.path)?;
        let events = diff_entries(&snapshot, &current);
        *snapshot = current;
        drop(snapshot);

        let count = events.len();
        for event in events {
            debug!(key = %event.key, path = %self.path.display(), "Storage changed externally");
            let _ = self.sender.send(event);
        }
        Ok(count)
    }

    /// Caller holds the write lock.
    fn apply(&self, changes: &[Change]) -> Result<()> {
        // Surface foreign writes first so they are not folded into our own.
        self.poll_changes()?;

        let mut snapshot = lock(&self.snapshot);
        let mut next = snapshot.clone();
        for (key, value) in changes {
            match value {
                Some(value) => next.insert(key.clone(), value.clone()),
                None => next.remove(key),
            };
        }
        if next == *snapshot {
            return Ok(());
        }

        write_entries(&self.path, &next)?;
        *snapshot = next;
        Ok(())
    }

    /// One attempt at writing the queue. Returns false while the lock is
    /// still held elsewhere.
    fn try_flush(&self) -> bool {
        let mut pending = lock(&self.pending);
        let _guard = match WriteLock::try_acquire(&self.path) {
            Ok(Some(guard)) => guard,
            Ok(None) => return false,
            Err(err) => {
                warn!(
                    error = %err,
                    dropped = pending.queue.len(),
                    "Cannot take storage lock; dropping deferred writes"
                );
                pending.queue.clear();
                pending.flushing = false;
                return true;
            }
        };

        let changes = std::mem::take(&mut pending.queue);
        pending.flushing = false;
        if let Err(err) = self.apply(&changes) {
            warn!(error = %err, dropped = changes.len(), "Failed to flush deferred writes");
        } else {
            debug!(writes = changes.len(), "Deferred storage writes flushed");
        }
        true
    }
}

async fn flush_pending(inner: Arc<FileInner>) {
    let mut attempts: u32 = 0;
    loop {
        tokio::time::sleep(lock_retry_delay()).await;
        if inner.try_flush() {
            return;
        }
        attempts += 1;
        if attempts == LOCK_MAX_ATTEMPTS {
            warn!(path = %inner.path.display(), "Still waiting for storage lock");
        }
    }
}

fn read_entries(path: &Path) -> Result<HashMap<String, String>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(source) => {
            return Err(SessionError::StorageRead {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    if content.trim().is_empty() {
        return Ok(HashMap::new());
    }

    match serde_json::from_str::<StoreFile>(&content) {
        Ok(file) if file.version == STORE_VERSION => Ok(file.entries),
        Ok(file) => {
            warn!(
                version = file.version,
                expected = STORE_VERSION,
                "Unsupported storage version, treating as empty"
            );
            Ok(HashMap::new())
        }
        Err(err) => {
            warn!(error = %err, path = %path.display(), "Corrupt storage file, treating as empty");
            Ok(HashMap::new())
        }
    }
}

fn write_entries(path: &Path, entries: &HashMap<String, String>) -> Result<()> {
    let file = StoreFile {
        version: STORE_VERSION,
        entries: entries.clone(),
    };
    let content =
        serde_json::to_string_pretty(&file).map_err(|err| SessionError::StorageCorrupt {
            path: path.to_path_buf(),
            details: err.to_string(),
        })?;

    let write_err = |source: std::io::Error| SessionError::StorageWrite {
        path: path.to_path_buf(),
        source,
    };
    let parent_dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp_file = NamedTempFile::new_in(parent_dir).map_err(write_err)?;
    temp_file.write_all(content.as_bytes()).map_err(write_err)?;
    temp_file.flush().map_err(write_err)?;
    temp_file
        .persist(path)
        .map_err(|err| write_err(err.error))?;
    Ok(())
}

/// Cross-process write lock: a sibling `<file>.lock/` directory. Directory
/// creation is atomic, so only one writer holds it at a time.
struct WriteLock {
    dir: PathBuf,
}

impl WriteLock {
    /// Takes the lock if it is free or stale; `None` while another writer
    /// holds it.
    fn try_acquire(path: &Path) -> Result<Option<Self>> {
        let dir = path.with_extension("lock");
        match std::fs::create_dir(&dir) {
            Ok(()) => Ok(Some(Self { dir })),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                if !lock_is_stale(&dir) {
                    return Ok(None);
                }
                warn!(path = %dir.display(), "Breaking stale storage lock");
                let _ = std::fs::remove_dir(&dir);
                Ok(std::fs::create_dir(&dir).ok().map(|()| Self { dir }))
            }
            Err(source) => Err(SessionError::StorageWrite { path: dir, source }),
        }
    }

    /// For callers outside any tokio runtime.
    fn acquire_blocking(path: &Path) -> Result<Self> {
        for _ in 0..LOCK_MAX_ATTEMPTS {
            if let Some(lock) = Self::try_acquire(path)? {
                return Ok(lock);
            }
            std::thread::sleep(lock_retry_delay());
        }
        Err(SessionError::StorageWrite {
            path: path.with_extension("lock"),
            source: std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                "timed out waiting for storage lock",
            ),
        })
    }
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir(&self.dir);
    }
}

fn lock_retry_delay() -> Duration {
    let jitter = rand::thread_rng().gen_range(0..=LOCK_RETRY_DELAY_MS);
    Duration::from_millis(LOCK_RETRY_DELAY_MS + jitter)
}

fn lock_is_stale(dir: &Path) -> bool {
    std::fs::metadata(dir)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .map(|age| age > Duration::from_secs(STALE_LOCK_SECS))
        .unwrap_or(false)
}
