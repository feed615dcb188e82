//! The append-only segmented key-value store.
//!
//! Scheduling model: parallel readers, one serialized writer. Reads take
//! the read lock and use positional I/O against the indexed segment;
//! every mutation is funneled through a single writer thread that owns
//! the right to touch the active segment and the index under the write
//! lock. A background thread periodically compacts sealed segments.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use crossbeam::select;
use tracing::{debug, error, info, instrument, warn};

use crate::config::StoreConfig;
use crate::error::{KvError, Result};
use crate::index::{IndexEntry, KeyDir};
use crate::record::{DataType, Record, Value};
use crate::segment::SegmentSet;

// capacity of the writer's request queue
const PUT_QUEUE_DEPTH: usize = 100;

/// one queued mutation plus its single-use reply channel
struct PutRequest {
    record: Record,
    reply: Sender<Result<()>>,
}

/// everything guarded by the store's reader-writer lock
struct StoreState {
    segments: SegmentSet,
    index: KeyDir,
    closed: bool,
}

struct Shared {
    state: RwLock<StoreState>,
    config: StoreConfig,
    put_tx: Sender<PutRequest>,
    done_rx: Receiver<()>,
    /// dropping this sender is the shutdown signal; `None` once closed
    done_tx: Mutex<Option<Sender<()>>>,
    /// single-holder gate so only one compaction runs at a time
    is_merging: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

/// A shared handle to one open store.
///
/// `Store` is cheap to clone; every clone observes the same state, which
/// is how connection handlers share the engine. Call [`Store::close`] to
/// shut down the background threads and release the file handles.
///
/// # Example
/// ```no_run
/// use segkv::{Store, StoreConfig};
/// # fn main() -> segkv::Result<()> {
/// let store = Store::open(StoreConfig::new("./data"))?;
/// store.put("greeting", "hello")?;
/// assert_eq!(store.get("greeting")?, "hello");
/// store.close()?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Store {
    shared: Arc<Shared>,
}

impl Store {
    /// Opens (or creates) the store described by `config`.
    ///
    /// Leftover merge files are removed, the index is rebuilt by scanning
    /// all segments in ascending id order, and a fresh active segment is
    /// created above the highest surviving id. Corruption encountered
    /// during the rebuild fails the open.
    #[instrument(skip(config), fields(dir = %config.dir.display()))]
    pub fn open(config: StoreConfig) -> Result<Store> {
        info!("opening segkv store version {}", env!("CARGO_PKG_VERSION"));
        let mut index = KeyDir::new();
        let segments = SegmentSet::open(&config.dir, &mut index)?;
        info!(
            keys = index.len(),
            active_id = segments.active_id(),
            "index rebuilt"
        );

        let (put_tx, put_rx) = channel::bounded::<PutRequest>(PUT_QUEUE_DEPTH);
        let (done_tx, done_rx) = channel::bounded::<()>(0);

        let store = Store {
            shared: Arc::new(Shared {
                state: RwLock::new(StoreState {
                    segments,
                    index,
                    closed: false,
                }),
                config,
                put_tx,
                done_rx,
                done_tx: Mutex::new(Some(done_tx)),
                is_merging: AtomicBool::new(false),
                threads: Mutex::new(Vec::new()),
            }),
        };

        let writer = {
            let shared = store.shared.clone();
            thread::Builder::new()
                .name("segkv-writer".into())
                .spawn(move || writer_loop(shared, put_rx))?
        };
        let merger = {
            let store = store.clone();
            thread::Builder::new()
                .name("segkv-merge".into())
                .spawn(move || merge_loop(store))?
        };
        {
            let mut threads = lock_plain(&store.shared.threads)?;
            threads.push(writer);
            threads.push(merger);
        }

        Ok(store)
    }

    /// Stores `value` under `key` as a string record.
    pub fn put(&self, key: &str, value: &str) -> Result<()> {
        self.submit(Record::new_str(key, value))
    }

    /// Stores `value` under `key` as an int64 record.
    pub fn put_int64(&self, key: &str, value: i64) -> Result<()> {
        self.submit(Record::new_int64(key, value))
    }

    /// Retrieves the string value stored under `key`.
    ///
    /// # Errors
    /// [`KvError::NotFound`] if the key is absent, [`KvError::WrongType`]
    /// if it holds an int64.
    pub fn get(&self, key: &str) -> Result<String> {
        match self.fetch(key, DataType::Str)? {
            Value::Str(s) => Ok(s),
            Value::Int64(_) => Err(KvError::WrongType),
        }
    }

    /// Retrieves the int64 value stored under `key`.
    ///
    /// # Errors
    /// [`KvError::NotFound`] if the key is absent, [`KvError::WrongType`]
    /// if it holds a string.
    pub fn get_int64(&self, key: &str) -> Result<i64> {
        match self.fetch(key, DataType::Int64)? {
            Value::Int64(i) => Ok(i),
            Value::Str(_) => Err(KvError::WrongType),
        }
    }

    /// Synchronously coalesces all sealed segments into one, keeping only
    /// the latest record per key. The active segment is never touched.
    ///
    /// If another compaction is already running this returns immediately
    /// as a no-op. With fewer than two sealed segments there is nothing
    /// to do.
    pub fn compact(&self) -> Result<()> {
        if self
            .shared
            .is_merging
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }
        let result = self.perform_merge();
        self.shared.is_merging.store(false, Ordering::SeqCst);
        result
    }

    /// Total bytes of segment files currently on disk.
    pub fn size(&self) -> Result<u64> {
        let state = read_lock(&self.shared.state)?;
        state.segments.disk_size()
    }

    /// id of the segment currently receiving appends
    pub fn active_segment_id(&self) -> Result<u64> {
        let state = read_lock(&self.shared.state)?;
        Ok(state.segments.active_id())
    }

    /// Shuts the store down: signals the writer and merge threads, waits
    /// for them to finish, then closes every file handle. Writes
    /// submitted after shutdown starts fail with [`KvError::Closed`];
    /// requests the writer already dequeued complete normally.
    ///
    /// Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let sender = lock_plain(&self.shared.done_tx)?.take();
        if sender.is_none() {
            return Ok(());
        }
        drop(sender);

        let handles: Vec<JoinHandle<()>> = {
            let mut threads = lock_plain(&self.shared.threads)?;
            threads.drain(..).collect()
        };
        for handle in handles {
            if handle.join().is_err() {
                error!("store background thread panicked during shutdown");
            }
        }

        let mut state = write_lock(&self.shared.state)?;
        state.closed = true;
        state.segments.close();
        info!("store closed");
        Ok(())
    }

    /// Submits a mutation to the writer loop and waits for its outcome.
    fn submit(&self, record: Record) -> Result<()> {
        let (reply_tx, reply_rx) = channel::bounded::<Result<()>>(1);
        let request = PutRequest {
            record,
            reply: reply_tx,
        };

        let put_tx = &self.shared.put_tx;
        let done_rx = &self.shared.done_rx;
        select! {
            send(put_tx, request) -> res => {
                if res.is_err() {
                    return Err(KvError::Closed);
                }
            }
            recv(done_rx) -> _ => return Err(KvError::Closed),
        }

        select! {
            recv(reply_rx) -> res => res.map_err(|_| KvError::Closed)?,
            recv(done_rx) -> _ => {
                // the writer may have delivered a result just before the
                // shutdown signal became visible
                match reply_rx.try_recv() {
                    Ok(res) => res,
                    Err(_) => Err(KvError::Closed),
                }
            }
        }
    }

    /// Index lookup plus positional read under the read lock.
    fn fetch(&self, key: &str, expected: DataType) -> Result<Value> {
        let state = read_lock(&self.shared.state)?;
        if state.closed {
            return Err(KvError::Closed);
        }
        let entry = *state.index.get(key).ok_or(KvError::NotFound)?;
        if entry.data_type != expected {
            return Err(KvError::WrongType);
        }
        let bytes = state
            .segments
            .read_record_at(entry.segment_id, entry.offset, entry.size)?;
        drop(state);

        let record = Record::decode(&bytes)?;
        Ok(record.value)
    }

    /// The actual merge, run while holding the write lock for the whole
    /// duration, so writes stall until the swap is finished.
    #[instrument(skip(self))]
    fn perform_merge(&self) -> Result<()> {
        let mut state = write_lock(&self.shared.state)?;
        if state.closed {
            return Err(KvError::Closed);
        }

        let sealed = state.segments.sealed_ids();
        if sealed.len() < 2 {
            return Ok(());
        }
        // the lowest sealed id is reused as the merge target
        let target = sealed[0];
        let tmp_path = state.segments.merge_tmp_path(target);

        let spliced = match write_merge_file(&state, &sealed, target, &tmp_path) {
            Ok(entries) => entries,
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                return Err(e);
            }
        };

        // swap: the temp file is already fsynced, so remove-then-rename
        // leaves either the old or the new content at the target path
        let final_path = state.segments.path_of(target);
        if let Err(e) = fs::remove_file(&final_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                let _ = fs::remove_file(&tmp_path);
                return Err(e.into());
            }
        }
        if let Err(e) = fs::rename(&tmp_path, &final_path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }

        let reader = File::open(&final_path)?;
        state.segments.replace_reader(target, reader);
        for (key, entry) in spliced {
            state.index.insert(key, entry);
        }
        for &id in &sealed[1..] {
            state.segments.remove_segment(id);
        }
        info!(
            merged = sealed.len(),
            target_id = target,
            "compacted sealed segments"
        );
        Ok(())
    }
}

/// Copies the latest record of every key living in a sealed segment into
/// the temp merge file, returning the spliced index entries. The file is
/// fsynced before this returns.
fn write_merge_file(
    state: &StoreState,
    sealed: &[u64],
    target: u64,
    tmp_path: &Path,
) -> Result<Vec<(String, IndexEntry)>> {
    let mut out = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(tmp_path)?;

    let mut spliced = Vec::new();
    let mut offset = 0u64;
    for (key, entry) in state.index.iter() {
        if !sealed.contains(&entry.segment_id) {
            continue;
        }
        let bytes = state
            .segments
            .read_record_at(entry.segment_id, entry.offset, entry.size)?;
        out.write_all(&bytes)?;
        spliced.push((
            key.clone(),
            IndexEntry {
                segment_id: target,
                offset,
                size: entry.size,
                data_type: entry.data_type,
            },
        ));
        offset += entry.size;
    }

    out.sync_all()?;
    Ok(spliced)
}

/// Single-consumer loop owning all mutations. Exits when the shutdown
/// channel disconnects, failing whatever is still queued.
fn writer_loop(shared: Arc<Shared>, put_rx: Receiver<PutRequest>) {
    let done_rx = shared.done_rx.clone();
    loop {
        select! {
            recv(put_rx) -> msg => match msg {
                Ok(request) => {
                    let result = apply_put(&shared, &request.record);
                    if let Err(e) = &result {
                        warn!(key = %request.record.key, error = %e, "write failed");
                    }
                    let _ = request.reply.send(result);
                }
                Err(_) => break,
            },
            recv(done_rx) -> _ => break,
        }
    }
    // fail requests that were queued but never dequeued
    while let Ok(request) = put_rx.try_recv() {
        let _ = request.reply.send(Err(KvError::Closed));
    }
    debug!("writer loop exited");
}

/// One write: encode, rotate the active segment if the record would push
/// it past the size cap, append, update the index. Runs under the write
/// lock.
fn apply_put(shared: &Shared, record: &Record) -> Result<()> {
    let encoded = record.encode();
    let record_size = encoded.len() as u64;

    let mut state = write_lock(&shared.state)?;
    let max = shared.config.max_segment_bytes;
    let mut offset = state.segments.active_size()?;
    if max > 0 && offset + record_size > max {
        state.segments.rotate()?;
        offset = state.segments.active_size()?;
    }
    state.segments.append(&encoded)?;
    let entry = IndexEntry {
        segment_id: state.segments.active_id(),
        offset,
        size: record_size,
        data_type: record.value.data_type(),
    };
    state.index.insert(record.key.clone(), entry);
    Ok(())
}

/// Periodic compaction driver. A tick that finds a merge already in
/// flight is a no-op through the `is_merging` gate.
fn merge_loop(store: Store) {
    let interval = store.shared.config.merge_interval;
    let done_rx = store.shared.done_rx.clone();
    loop {
        match done_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {
                if let Err(e) = store.compact() {
                    warn!(error = %e, "periodic merge failed");
                }
            }
            Ok(_) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("merge loop exited");
}

fn read_lock(lock: &RwLock<StoreState>) -> Result<RwLockReadGuard<'_, StoreState>> {
    lock.read()
        .map_err(|_| KvError::Locking("store lock poisoned".into()))
}

fn write_lock(lock: &RwLock<StoreState>) -> Result<RwLockWriteGuard<'_, StoreState>> {
    lock.write()
        .map_err(|_| KvError::Locking("store lock poisoned".into()))
}

fn lock_plain<T>(lock: &Mutex<T>) -> Result<std::sync::MutexGuard<'_, T>> {
    lock.lock()
        .map_err(|_| KvError::Locking("store lock poisoned".into()))
}
