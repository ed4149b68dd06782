//! Storage engine
//!
//! One database is one file and one worker task. The worker owns the
//! engine state and drains a request channel, so exactly one transaction
//! runs at a time; `transaction` posts a closure and awaits its reply.
//! Privileged operations check a task-local marker scoped around the
//! transaction future, which is what "runs inside the transaction" means
//! here.
//!
//! The published root and the next write slot change only after the new
//! root block is durably on disk. A transaction that fails first leaves
//! both untouched, and a torn write lands in the slot that was due for
//! reuse anyway, where the checksum disqualifies it on the next open.

use std::collections::HashSet;
use std::future::Future;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use anyhow::Result;
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::Mutex;

use super::block;
use super::block::RootBlock;
use super::block::MIN_BLOCK_SIZE;
use super::file::StoreFile;
use super::SpaceManager;
use super::StoreError;
use crate::codec::default_registry;
use crate::tree::Timestamp;
use crate::tree::VersionedMap;

tokio::task_local! {
    static CURRENT_TX: u64;
}

// Files open in this process. Double-opening one database would break the
// slot alternation protocol.
static OPEN_PATHS: Lazy<StdMutex<HashSet<PathBuf>>> = Lazy::new(|| StdMutex::new(HashSet::new()));

type TxFuture = BoxFuture<'static, Result<VersionedMap>>;
type TxFn = Box<dyn FnOnce(Transaction) -> TxFuture + Send>;

enum Job {
    Transaction {
        f: TxFn,
        reply: oneshot::Sender<Result<()>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

struct EngineState {
    file: StoreFile,
    space: SpaceManager,
    current: VersionedMap,
    next_root_position: u64,
    last_timestamp: Timestamp,
}

struct StoreShared {
    lock_key: PathBuf,
    max_block_size: u32,
    state: Mutex<Option<EngineState>>,
    snapshot: RwLock<(VersionedMap, Timestamp)>,
    closed: AtomicBool,
}

/// A versioned store backed by a single file.
///
/// All mutation goes through [`Store::transaction`]; reads can use any
/// snapshot without coordination, including snapshots taken before later
/// commits.
pub struct Store {
    jobs: mpsc::Sender<Job>,
    shared: Arc<StoreShared>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

/// Handle passed to a transaction closure.
///
/// Carries the root the transaction starts from, the transaction
/// timestamp, and the privileged block operations. The privileged
/// operations only work while the closure's future is running on the
/// store worker; from anywhere else they fail with
/// [`StoreError::PrivilegeViolation`].
pub struct Transaction {
    shared: Arc<StoreShared>,
    id: u64,
    timestamp: Timestamp,
    root: VersionedMap,
}

impl Store {
    /// Create a new database; fails if the path already exists.
    pub async fn create<P: AsRef<Path>>(path: P, max_block_size: u32) -> Result<Self> {
        let path = path.as_ref();
        check_block_size(max_block_size)?;

        tracing::info!("Creating store at: {}", path.display());

        let mut file = StoreFile::try_create(path, max_block_size).await?;
        let lock_key = lock_key(path);
        register_path(&lock_key)?;

        let timestamp = now_millis();
        let space = SpaceManager::new();
        let root = VersionedMap::new();
        let initial = RootBlock {
            timestamp,
            space,
            root,
        };
        let bytes = match initial.encode(default_registry(), max_block_size) {
            Ok(bytes) => bytes,
            Err(e) => {
                unregister_path(&lock_key);
                return Err(e.into());
            }
        };
        if let Err(e) = file.write_slot(0, &bytes).await {
            unregister_path(&lock_key);
            return Err(e.into());
        }

        let RootBlock { space, root, .. } = initial;
        let shared = Arc::new(StoreShared {
            lock_key,
            max_block_size,
            state: Mutex::new(Some(EngineState {
                file,
                space,
                current: root.clone(),
                next_root_position: max_block_size as u64,
                last_timestamp: timestamp,
            })),
            snapshot: RwLock::new((root, timestamp)),
            closed: AtomicBool::new(false),
        });
        Ok(Self::launch(shared))
    }

    /// Open an existing database.
    ///
    /// Both root slots are validated against `max_block_size` and their
    /// digests; the newer valid one becomes current and the other is the
    /// next to be overwritten. A single bad slot is absorbed with a
    /// warning.
    pub async fn open<P: AsRef<Path>>(path: P, max_block_size: u32) -> Result<Self> {
        let path = path.as_ref();
        check_block_size(max_block_size)?;

        tracing::info!("Opening store at: {}", path.display());

        let lock_key = lock_key(path);
        register_path(&lock_key)?;
        match Self::open_inner(path, max_block_size).await {
            Ok((file, chosen, next_root_position)) => {
                let RootBlock {
                    timestamp,
                    space,
                    root,
                } = chosen;
                let shared = Arc::new(StoreShared {
                    lock_key,
                    max_block_size,
                    state: Mutex::new(Some(EngineState {
                        file,
                        space,
                        current: root.clone(),
                        next_root_position,
                        last_timestamp: timestamp,
                    })),
                    snapshot: RwLock::new((root, timestamp)),
                    closed: AtomicBool::new(false),
                });
                Ok(Self::launch(shared))
            }
            Err(e) => {
                unregister_path(&lock_key);
                Err(e.into())
            }
        }
    }

    async fn open_inner(
        path: &Path,
        max_block_size: u32,
    ) -> Result<(StoreFile, RootBlock, u64), StoreError> {
        let mut file = StoreFile::try_open(path, max_block_size).await?;
        let slot_1 = max_block_size as u64;
        let first = read_root(&mut file, 0, max_block_size).await?;
        let second = read_root(&mut file, slot_1, max_block_size).await?;
        match (first, second) {
            (Some(a), Some(b)) => {
                if a.timestamp >= b.timestamp {
                    Ok((file, a, slot_1))
                } else {
                    Ok((file, b, 0))
                }
            }
            (Some(a), None) => Ok((file, a, slot_1)),
            (None, Some(b)) => Ok((file, b, 0)),
            (None, None) => Err(StoreError::NoValidRoot),
        }
    }

    fn launch(shared: Arc<StoreShared>) -> Self {
        let (jobs, rx) = mpsc::channel(16);
        tokio::spawn(run_worker(shared.clone(), rx));
        Self { jobs, shared }
    }

    /// Run `f` as the single mutation of this store.
    ///
    /// `f` receives a [`Transaction`] and returns the new root. Returning
    /// the root unchanged is a durable no-op. Otherwise the new root is
    /// serialized, checksummed and written to the slot due for reuse; it
    /// is published only after the write syncs. A failure anywhere leaves
    /// the previously committed root untouched.
    pub async fn transaction<F, Fut>(&self, f: F) -> Result<()>
    where
        F: FnOnce(Transaction) -> Fut + Send + 'static,
        Fut: Future<Output = Result<VersionedMap>> + Send + 'static,
    {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed.into());
        }
        // Starting a transaction from inside one would deadlock the worker
        if CURRENT_TX.try_with(|_| ()).is_ok() {
            return Err(StoreError::PrivilegeViolation.into());
        }
        let (reply, rx) = oneshot::channel();
        let job = Job::Transaction {
            f: Box::new(move |tx| Box::pin(f(tx))),
            reply,
        };
        self.jobs
            .send(job)
            .await
            .map_err(|_| StoreError::Closed)?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    /// The current committed root, usable as a read snapshot.
    pub fn snapshot(&self) -> VersionedMap {
        self.shared
            .snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .0
            .clone()
    }

    /// Timestamp of the last committed transaction.
    pub fn timestamp(&self) -> Timestamp {
        self.shared
            .snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .1
    }

    /// Configured root-block capacity.
    pub fn max_block_size(&self) -> u32 {
        self.shared.max_block_size
    }

    /// Stop the worker and release the file. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if CURRENT_TX.try_with(|_| ()).is_ok() {
            return Err(StoreError::PrivilegeViolation.into());
        }
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let (reply, rx) = oneshot::channel();
        if self.jobs.send(Job::Close { reply }).await.is_ok() {
            let _ = rx.await;
        }
        unregister_path(&self.shared.lock_key);
        Ok(())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            unregister_path(&self.shared.lock_key);
        }
    }
}

impl Transaction {
    /// The root this transaction starts from.
    pub fn root(&self) -> VersionedMap {
        self.root.clone()
    }

    /// This transaction's timestamp. Strictly greater than every earlier
    /// transaction's against the same store.
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    fn check_privilege(&self) -> Result<(), StoreError> {
        match CURRENT_TX.try_with(|id| *id) {
            Ok(id) if id == self.id => Ok(()),
            _ => Err(StoreError::PrivilegeViolation),
        }
    }

    /// Reserve a secondary payload block number.
    pub async fn allocate(&self) -> Result<u64> {
        self.check_privilege()?;
        let mut guard = self.shared.state.lock().await;
        let state = guard.as_mut().ok_or(StoreError::Closed)?;
        Ok(state.space.allocate()?)
    }

    /// Schedule a payload block for reuse after this transaction commits.
    pub async fn release(&self, blocknbr: u64) -> Result<()> {
        self.check_privilege()?;
        let mut guard = self.shared.state.lock().await;
        let state = guard.as_mut().ok_or(StoreError::Closed)?;
        Ok(state.space.release(blocknbr)?)
    }

    /// Count of payload blocks currently live.
    pub async fn usage(&self) -> Result<u64> {
        self.check_privilege()?;
        let mut guard = self.shared.state.lock().await;
        let state = guard.as_mut().ok_or(StoreError::Closed)?;
        Ok(state.space.usage()?)
    }

    /// Read secondary payload block `blocknbr`.
    pub async fn read_block(&self, blocknbr: u64) -> Result<Vec<u8>> {
        self.check_privilege()?;
        let mut guard = self.shared.state.lock().await;
        let state = guard.as_mut().ok_or(StoreError::Closed)?;
        Ok(state.file.read_block(blocknbr).await?)
    }

    /// Write secondary payload block `blocknbr`.
    pub async fn write_block(&self, blocknbr: u64, data: &[u8]) -> Result<()> {
        self.check_privilege()?;
        let mut guard = self.shared.state.lock().await;
        let state = guard.as_mut().ok_or(StoreError::Closed)?;
        Ok(state.file.write_block(blocknbr, data).await?)
    }
}

async fn run_worker(shared: Arc<StoreShared>, mut jobs: mpsc::Receiver<Job>) {
    let mut next_tx_id: u64 = 1;
    while let Some(job) = jobs.recv().await {
        match job {
            Job::Transaction { f, reply } => {
                let id = next_tx_id;
                next_tx_id += 1;
                let result = run_transaction(&shared, id, f).await;
                let _ = reply.send(result);
            }
            Job::Close { reply } => {
                let mut guard = shared.state.lock().await;
                *guard = None;
                let _ = reply.send(());
                break;
            }
        }
    }
    tracing::debug!("store worker stopped");
}

async fn run_transaction(shared: &Arc<StoreShared>, id: u64, f: TxFn) -> Result<()> {
    let (root, timestamp) = {
        let mut guard = shared.state.lock().await;
        let state = guard.as_mut().ok_or(StoreError::Closed)?;
        state.space.begin();
        let timestamp = now_millis().max(state.last_timestamp + 1);
        (state.current.clone(), timestamp)
    };

    let tx = Transaction {
        shared: shared.clone(),
        id,
        timestamp,
        root,
    };
    let outcome = CURRENT_TX.scope(id, f(tx)).await;

    let mut guard = shared.state.lock().await;
    let state = guard.as_mut().ok_or(StoreError::Closed)?;
    let new_root = match outcome {
        Ok(new_root) => new_root,
        Err(e) => {
            state.space.rollback();
            return Err(e);
        }
    };

    if new_root.same_root(&state.current) {
        // Nothing changed, nothing to make durable
        state.space.rollback();
        return Ok(());
    }

    if let Err(e) = commit_root(state, shared.max_block_size, &new_root, timestamp).await {
        state.space.rollback();
        return Err(e.into());
    }
    state.space.end();

    let mut snapshot = shared
        .snapshot
        .write()
        .unwrap_or_else(PoisonError::into_inner);
    *snapshot = (new_root, timestamp);
    Ok(())
}

async fn commit_root(
    state: &mut EngineState,
    max_block_size: u32,
    new_root: &VersionedMap,
    timestamp: Timestamp,
) -> Result<(), StoreError> {
    // The ledger is durable content, so staged releases apply before it
    // is measured and serialized.
    state.space.commit()?;
    let bytes = block::encode_root(
        timestamp,
        &state.space,
        new_root,
        default_registry(),
        max_block_size,
    )?;
    let position = state.next_root_position;
    tracing::debug!(position, block_size = bytes.len(), "writing root block");
    state.file.write_slot(position, &bytes).await?;

    // Durable: now, and only now, publish
    state.next_root_position = if position == 0 {
        max_block_size as u64
    } else {
        0
    };
    state.current = new_root.clone();
    state.last_timestamp = timestamp;
    Ok(())
}

async fn read_root(
    file: &mut StoreFile,
    offset: u64,
    max_block_size: u32,
) -> Result<Option<RootBlock>, StoreError> {
    let buf = match file.read_slot(offset).await {
        Ok(buf) => buf,
        Err(e) => {
            tracing::warn!("unreadable root slot at offset {offset}: {e}");
            return Ok(None);
        }
    };
    match RootBlock::decode(&buf, default_registry(), max_block_size, offset) {
        Ok(root) => Ok(Some(root)),
        Err(e @ (StoreError::ChecksumMismatch(_) | StoreError::SizeMismatch { .. })) => {
            tracing::warn!("invalid root slot at offset {offset}: {e}");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn check_block_size(max_block_size: u32) -> Result<(), StoreError> {
    if max_block_size < MIN_BLOCK_SIZE {
        return Err(StoreError::RootBlockTooLarge {
            size: MIN_BLOCK_SIZE as usize,
            max: max_block_size as usize,
        });
    }
    Ok(())
}

fn lock_key(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| {
        if path.is_absolute() {
            path.into()
        } else {
            std::env::current_dir()
                .map(|dir| dir.join(path))
                .unwrap_or_else(|_| path.into())
        }
    })
}

fn register_path(key: &Path) -> Result<(), StoreError> {
    let mut open = OPEN_PATHS
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    if !open.insert(key.to_path_buf()) {
        return Err(StoreError::AlreadyOpen(key.to_path_buf()));
    }
    Ok(())
}

fn unregister_path(key: &Path) {
    OPEN_PATHS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(key);
}

fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Timestamp)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests;
