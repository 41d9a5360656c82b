//! The Transfer Engine: a bounded pool of OS threads, each bound to its own
//! source/destination capability, draining a shared FIFO queue of chunks.
//!
//! OS threads rather than async tasks because the underlying SSH binding
//! (`ssh2`) is a synchronous wrapper around libssh2; the CLI/orchestrator
//! layer above this module stays tokio-async and drives `run` via
//! `spawn_blocking`.

use crate::chunk::ChunkStatus;
use crate::config::TransferConfig;
use crate::error::{Result, TransferError};
use crate::manifest::{Manifest, ManifestStore, TaskStatus};
use crate::progress::ProgressSink;
use crate::progress::ProgressTracker;
use crate::transfer::rate_limiter::RateLimiter;
use crate::transfer::Capability;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// What a worker thread needs to do its own I/O, independent of every other
/// worker: a fresh source and destination handle apiece. Building these
/// lazily (rather than sharing one `Capability` across threads) keeps each
/// SSH/SFTP session single-owner.
pub struct EngineHandles {
    pub make_source: Box<dyn Fn() -> Result<Box<dyn Capability>> + Send + Sync>,
    pub make_dest: Box<dyn Fn() -> Result<Box<dyn Capability>> + Send + Sync>,
}

pub struct TransferResult {
    pub bytes_transferred: u64,
    pub chunks: usize,
    pub elapsed: Duration,
    pub file_hash: String,
}

struct Coalescer {
    manifest: Mutex<Manifest>,
    dirty: AtomicBool,
    saving: Mutex<()>,
}

impl Coalescer {
    fn mark_dirty_and_maybe_save(&self, store: &ManifestStore) -> Result<()> {
        self.dirty.store(true, Ordering::SeqCst);
        let Ok(_guard) = self.saving.try_lock() else {
            // Someone else is already saving; they'll observe the dirty bit
            // we just set and loop again before releasing the lock.
            return Ok(());
        };
        loop {
            if !self.dirty.swap(false, Ordering::SeqCst) {
                break;
            }
            let snapshot = self.manifest.lock().unwrap().clone();
            store.save(&snapshot)?;
        }
        Ok(())
    }

    fn force_save(&self, store: &ManifestStore) -> Result<()> {
        let snapshot = self.manifest.lock().unwrap().clone();
        store.save(&snapshot)
    }
}

pub struct TransferEngine {
    config: TransferConfig,
    store: Arc<ManifestStore>,
    progress: Arc<ProgressTracker>,
    sink: Arc<dyn ProgressSink>,
    rate_limiter: RateLimiter,
    cancel: Arc<AtomicBool>,
}

impl TransferEngine {
    /// `burst` must be the task's actual resolved per-chunk size (the same
    /// value stored in `manifest.config.chunk_size`), not the raw
    /// `--chunk` override -- a burst smaller than the chunk size being
    /// transferred would make `RateLimiter::acquire` wait forever.
    /// `cancel` is owned by the caller so a signal handler installed before
    /// this engine starts running can request a graceful stop.
    pub fn new(
        config: TransferConfig,
        store: Arc<ManifestStore>,
        progress: Arc<ProgressTracker>,
        sink: Arc<dyn ProgressSink>,
        burst: u64,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        let rate_limiter = RateLimiter::new(config.limit_rate, burst);
        TransferEngine {
            config,
            store,
            progress,
            sink,
            rate_limiter,
            cancel,
        }
    }

    /// A clone of this engine's cancellation flag; set it to request a
    /// graceful stop (e.g. from a Ctrl-C handler).
    pub fn cancel_token(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Run every Pending chunk to completion, then verify the whole file and
    /// publish it at its final path. Returns the final manifest (status
    /// `Completed`, `Paused`, or `Failed`) plus a result summary on success.
    /// `finalize_mode` is the `Some(mode)` to apply to the destination when
    /// `-p`/`--preserve` was requested, `None` otherwise.
    pub fn run(
        &self,
        mut manifest: Manifest,
        handles: EngineHandles,
        mut dest_finalizer: Box<dyn Capability>,
        finalize_mode: Option<u32>,
    ) -> Result<(Manifest, TransferResult)> {
        let start = Instant::now();
        manifest.status = TaskStatus::Running;

        let pending: Vec<usize> = manifest
            .chunks
            .iter()
            .filter(|c| c.status != ChunkStatus::Completed)
            .map(|c| c.index)
            .collect();

        // Pre-count bytes already completed on resume so progress starts
        // from the right baseline.
        let already_done: u64 = manifest
            .chunks
            .iter()
            .filter(|c| c.status == ChunkStatus::Completed)
            .map(|c| c.size)
            .sum();
        self.progress.add_bytes(already_done);

        let worker_count = self.config.effective_parallel().min(pending.len().max(1));

        let (tx, rx): (Sender<usize>, Receiver<usize>) = unbounded();
        for idx in &pending {
            tx.send(*idx).unwrap();
        }

        let coalescer = Arc::new(Coalescer {
            manifest: Mutex::new(manifest),
            dirty: AtomicBool::new(false),
            saving: Mutex::new(()),
        });

        let handles = Arc::new(handles);
        let first_fatal: Arc<Mutex<Option<TransferError>>> = Arc::new(Mutex::new(None));

        let mut join_handles = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let rx = rx.clone();
            let tx = tx.clone();
            let handles = handles.clone();
            let coalescer = coalescer.clone();
            let store = self.store.clone();
            let progress = self.progress.clone();
            let sink = self.sink.clone();
            let rate_limiter = self.rate_limiter.clone();
            let cancel = self.cancel.clone();
            let config = self.config.clone();
            let first_fatal = first_fatal.clone();

            let handle = std::thread::spawn(move || {
                worker_loop(WorkerContext {
                    rx,
                    tx,
                    handles,
                    coalescer,
                    store,
                    progress,
                    sink,
                    rate_limiter,
                    cancel,
                    config,
                    first_fatal,
                });
            });
            join_handles.push(handle);
        }
        drop(tx);
        drop(rx);

        // Push a snapshot to the sink on a fixed cadence, independent of
        // chunk completion -- a single chunk can take well over a second on
        // a slow link, which would otherwise starve the sink of updates.
        let ticker_stop = Arc::new(AtomicBool::new(false));
        let ticker = {
            let progress = self.progress.clone();
            let sink = self.sink.clone();
            let stop = ticker_stop.clone();
            std::thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(50));
                    sink.on_update(progress.snapshot());
                }
            })
        };

        self.drain(join_handles);
        ticker_stop.store(true, Ordering::SeqCst);
        let _ = ticker.join();

        coalescer.force_save(&self.store)?;

        if self.cancel.load(Ordering::SeqCst) {
            let mut manifest = coalescer.manifest.lock().unwrap().clone();
            manifest.status = TaskStatus::Paused;
            self.store.save(&manifest)?;
            return Err(TransferError::Cancelled);
        }

        if let Some(err) = first_fatal.lock().unwrap().take() {
            let mut manifest = coalescer.manifest.lock().unwrap().clone();
            manifest.status = TaskStatus::Failed;
            self.store.save(&manifest)?;
            return Err(err);
        }

        let mut manifest = coalescer.manifest.lock().unwrap().clone();

        let file_hash = self.verify_whole_file(&mut *dest_finalizer, manifest.file_size)?;
        if let Some(expected) = &manifest.file_hash {
            if !crate::verify::digests_equal(expected, &file_hash) {
                manifest.status = TaskStatus::Failed;
                self.store.save(&manifest)?;
                return Err(TransferError::IntegrityError {
                    expected: expected.clone(),
                    actual: file_hash,
                });
            }
        } else {
            manifest.file_hash = Some(file_hash.clone());
        }

        // Publish before marking the manifest Completed: if the process dies
        // between these two steps, a crash recovery must find either an
        // in-progress manifest with no destination yet, or a destination
        // that already exists alongside a Completed manifest -- never a
        // Completed manifest pointing at a destination that was never
        // actually published.
        if let Err(e) = dest_finalizer.finalize(finalize_mode) {
            manifest.status = TaskStatus::Failed;
            self.store.save(&manifest)?;
            return Err(e);
        }

        manifest.status = TaskStatus::Completed;
        self.store.save(&manifest)?;

        let result = TransferResult {
            bytes_transferred: manifest.file_size,
            chunks: manifest.chunks.len(),
            elapsed: start.elapsed(),
            file_hash,
        };
        self.sink.on_finish(self.progress.snapshot());
        Ok((manifest, result))
    }

    /// Join every worker, but give up waiting once `config.timeout` has
    /// elapsed after cancellation was requested; threads we can't join in
    /// time are left to finish on their own (Rust has no way to forcibly
    /// terminate a running OS thread) and their progress is simply ignored.
    fn drain(&self, join_handles: Vec<std::thread::JoinHandle<()>>) {
        let deadline = Instant::now() + self.config.timeout;
        for handle in join_handles {
            if self.cancel.load(Ordering::SeqCst) {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    // Detach: the thread keeps running but we stop waiting.
                    drop(handle);
                    continue;
                }
            }
            let _ = handle.join();
        }
    }

    fn verify_whole_file(&self, cap: &mut dyn Capability, file_size: u64) -> Result<String> {
        use sha2::{Digest, Sha256};
        const WINDOW: u64 = 4 * 1024 * 1024;
        let mut hasher = Sha256::new();
        let mut offset = 0u64;
        while offset < file_size {
            let len = WINDOW.min(file_size - offset);
            let data = cap.read_range(offset, len)?;
            hasher.update(&data);
            offset += len;
        }
        Ok(hex::encode(hasher.finalize()))
    }
}

struct WorkerContext {
    rx: Receiver<usize>,
    tx: Sender<usize>,
    handles: Arc<EngineHandles>,
    coalescer: Arc<Coalescer>,
    store: Arc<ManifestStore>,
    progress: Arc<ProgressTracker>,
    sink: Arc<dyn ProgressSink>,
    rate_limiter: RateLimiter,
    cancel: Arc<AtomicBool>,
    config: TransferConfig,
    first_fatal: Arc<Mutex<Option<TransferError>>>,
}

fn worker_loop(ctx: WorkerContext) {
    let mut source = match (ctx.handles.make_source)() {
        Ok(cap) => cap,
        Err(e) => {
            record_fatal(&ctx.first_fatal, e);
            ctx.cancel.store(true, Ordering::SeqCst);
            return;
        }
    };
    let mut dest = match (ctx.handles.make_dest)() {
        Ok(cap) => cap,
        Err(e) => {
            record_fatal(&ctx.first_fatal, e);
            ctx.cancel.store(true, Ordering::SeqCst);
            return;
        }
    };

    while let Ok(index) = ctx.rx.recv() {
        if ctx.cancel.load(Ordering::SeqCst) {
            return;
        }

        let (offset, size, attempts) = {
            let mut manifest = ctx.coalescer.manifest.lock().unwrap();
            let chunk = &mut manifest.chunks[index];
            chunk.status = ChunkStatus::InProgress;
            chunk.attempts += 1;
            (chunk.offset, chunk.size, chunk.attempts)
        };

        if ctx.cancel.load(Ordering::SeqCst) {
            return;
        }

        ctx.rate_limiter.acquire(size);
        ctx.progress.chunk_started();
        let outcome = transfer_one_chunk(&mut *source, &mut *dest, offset, size);
        ctx.progress.chunk_finished();

        match outcome {
            Ok(sha256) => {
                let mut manifest = ctx.coalescer.manifest.lock().unwrap();
                let chunk = &mut manifest.chunks[index];
                chunk.status = ChunkStatus::Completed;
                chunk.sha256 = Some(sha256);
                chunk.error = None;
                manifest.updated_at = now_secs();
                drop(manifest);
                ctx.progress.add_bytes(size);
                ctx.sink.on_update(ctx.progress.snapshot());
                if let Err(e) = ctx.coalescer.mark_dirty_and_maybe_save(&ctx.store) {
                    record_fatal(&ctx.first_fatal, e);
                    ctx.cancel.store(true, Ordering::SeqCst);
                    return;
                }
            }
            Err(e) => {
                let cause = e.to_string();
                let mut manifest = ctx.coalescer.manifest.lock().unwrap();
                let chunk = &mut manifest.chunks[index];
                chunk.status = ChunkStatus::Failed;
                chunk.error = Some(cause.clone());
                drop(manifest);

                if attempts <= ctx.config.max_retries {
                    let backoff = jittered_backoff(ctx.config.retry_delay, attempts);
                    if !sleep_cancellable(backoff, &ctx.cancel) {
                        return;
                    }
                    let mut manifest = ctx.coalescer.manifest.lock().unwrap();
                    manifest.chunks[index].status = ChunkStatus::Pending;
                    drop(manifest);
                    let _ = ctx.tx.send(index);
                } else {
                    record_fatal(
                        &ctx.first_fatal,
                        TransferError::ChunkFailed {
                            index,
                            attempts,
                            cause,
                        },
                    );
                    ctx.cancel.store(true, Ordering::SeqCst);
                    return;
                }
            }
        }
    }
}

fn transfer_one_chunk(
    source: &mut dyn Capability,
    dest: &mut dyn Capability,
    offset: u64,
    size: u64,
) -> Result<String> {
    let data = source.read_range(offset, size)?;
    dest.write_range(offset, &data)?;
    Ok(crate::verify::hash_buf(&data))
}

fn record_fatal(slot: &Mutex<Option<TransferError>>, err: TransferError) {
    let mut guard = slot.lock().unwrap();
    if guard.is_none() {
        *guard = Some(err);
    }
}

/// `retry_delay * 2^(attempts-1)`, jittered by +/-20%.
fn jittered_backoff(retry_delay: f64, attempts: u32) -> Duration {
    let base = retry_delay * 2f64.powi(attempts as i32 - 1);
    let jitter = rand::thread_rng().gen_range(-0.2..=0.2);
    let secs = (base * (1.0 + jitter)).max(0.0);
    Duration::from_secs_f64(secs)
}

/// Sleep in short slices so cancellation is noticed promptly instead of
/// only after the full backoff elapses. Returns false if cancelled mid-sleep.
fn sleep_cancellable(total: Duration, cancel: &AtomicBool) -> bool {
    const SLICE: Duration = Duration::from_millis(50);
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if cancel.load(Ordering::SeqCst) {
            return false;
        }
        let step = remaining.min(SLICE);
        std::thread::sleep(step);
        remaining -= step;
    }
    !cancel.load(Ordering::SeqCst)
}

use rand::Rng;

fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;
    use crate::endpoint::Endpoint;
    use crate::manifest::ManifestConfig;
    use crate::progress::NoOpSink;
    use crate::transfer::LocalIo;

    /// Build a contiguous Pending chunk list from explicit sizes, bypassing
    /// `chunk::plan`'s single-chunk threshold -- lets small test fixtures
    /// still exercise multi-worker parallelism.
    fn manual_chunks(sizes: &[u64]) -> Vec<Chunk> {
        let mut offset = 0u64;
        let mut chunks = Vec::with_capacity(sizes.len());
        for (index, &size) in sizes.iter().enumerate() {
            chunks.push(Chunk {
                index,
                offset,
                size,
                status: ChunkStatus::Pending,
                sha256: None,
                attempts: 0,
                error: None,
            });
            offset += size;
        }
        chunks
    }

    fn make_manifest(file_size: u64, chunks: Vec<crate::chunk::Chunk>) -> Manifest {
        Manifest::new(
            "task1".to_string(),
            Endpoint::parse("/tmp/src.bin").unwrap(),
            Endpoint::parse("/tmp/dst.bin").unwrap(),
            file_size,
            1000.0,
            chunks,
            ManifestConfig {
                parallel: 2,
                aria2: false,
                chunk_size: 64_000,
            },
            1000.0,
        )
    }

    #[test]
    fn full_transfer_round_trips_and_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let src_path = dir.path().join("src.bin");
        let dst_path = dir.path().join("dst.bin");
        let data: Vec<u8> = (0..200_000u32).map(|n| (n % 251) as u8).collect();
        std::fs::write(&src_path, &data).unwrap();

        let chunks = manual_chunks(&[64_000, 64_000, 64_000, 8_000]);
        let manifest = make_manifest(data.len() as u64, chunks);

        let store = Arc::new(ManifestStore::new(dir.path().join("manifests")));
        let config = TransferConfig {
            parallel: 3,
            ..TransferConfig::default()
        };
        let progress = Arc::new(ProgressTracker::new(data.len() as u64));
        let engine = TransferEngine::new(
            config,
            store.clone(),
            progress,
            Arc::new(NoOpSink),
            64_000,
            Arc::new(AtomicBool::new(false)),
        );

        let src_for_source = src_path.clone();
        let dst_for_dest = dst_path.clone();
        let task_id = "task1".to_string();
        let task_id_dest = task_id.clone();
        let handles = EngineHandles {
            make_source: Box::new(move || {
                Ok(Box::new(LocalIo::open_source(&src_for_source)?) as Box<dyn Capability>)
            }),
            make_dest: Box::new(move || {
                Ok(Box::new(LocalIo::open_staging(&dst_for_dest, &task_id_dest)?)
                    as Box<dyn Capability>)
            }),
        };
        let finalizer = Box::new(LocalIo::open_staging(&dst_path, &task_id).unwrap());

        let (final_manifest, result) = engine.run(manifest, handles, finalizer, None).unwrap();
        assert_eq!(final_manifest.status, TaskStatus::Completed);
        assert_eq!(result.bytes_transferred, data.len() as u64);

        // the engine finalizes the destination itself before marking the
        // manifest Completed -- the staging file is gone, renamed into place.
        let staging = crate::transfer::staging_path_for(&dst_path, "task1");
        assert!(!staging.exists());
        assert!(dst_path.exists());
        assert_eq!(std::fs::read(&dst_path).unwrap(), data);
        assert_eq!(result.file_hash, crate::verify::hash_buf(&data));
    }

    #[test]
    fn resume_skips_already_completed_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let src_path = dir.path().join("src.bin");
        let dst_path = dir.path().join("dst.bin");
        let data = vec![7u8; 10_000];
        std::fs::write(&src_path, &data).unwrap();

        let mut chunks = manual_chunks(&[4_000, 4_000, 2_000]);
        // Pretend the first chunk already completed with correct content
        // pre-written into the staging file.
        let task_id = "resume1".to_string();
        let staging = crate::transfer::staging_path_for(&dst_path, &task_id);
        std::fs::write(&staging, vec![0u8; data.len()]).unwrap();
        {
            let mut f = std::fs::OpenOptions::new().write(true).open(&staging).unwrap();
            use std::io::{Seek, SeekFrom, Write};
            f.seek(SeekFrom::Start(0)).unwrap();
            f.write_all(&data[0..chunks[0].size as usize]).unwrap();
        }
        chunks[0].status = ChunkStatus::Completed;
        chunks[0].sha256 = Some(crate::verify::hash_buf(&data[0..chunks[0].size as usize]));

        let mut manifest = make_manifest(data.len() as u64, chunks);
        manifest.task_id = task_id.clone();

        let store = Arc::new(ManifestStore::new(dir.path().join("manifests")));
        let config = TransferConfig::default();
        let progress = Arc::new(ProgressTracker::new(data.len() as u64));
        let engine = TransferEngine::new(
            config,
            store,
            progress,
            Arc::new(NoOpSink),
            4_000,
            Arc::new(AtomicBool::new(false)),
        );

        let src_for_source = src_path.clone();
        let dst_for_dest = dst_path.clone();
        let task_id_dest = task_id.clone();
        let handles = EngineHandles {
            make_source: Box::new(move || {
                Ok(Box::new(LocalIo::open_source(&src_for_source)?) as Box<dyn Capability>)
            }),
            make_dest: Box::new(move || {
                Ok(Box::new(LocalIo::open_staging(&dst_for_dest, &task_id_dest)?)
                    as Box<dyn Capability>)
            }),
        };
        let finalizer = Box::new(LocalIo::open_staging(&dst_path, &task_id).unwrap());

        let (final_manifest, _) = engine.run(manifest, handles, finalizer, None).unwrap();
        assert_eq!(final_manifest.status, TaskStatus::Completed);
        assert!(final_manifest
            .chunks
            .iter()
            .all(|c| c.status == ChunkStatus::Completed));

        assert_eq!(std::fs::read(&dst_path).unwrap(), data);
    }

    #[test]
    fn mismatched_expected_hash_is_integrity_error() {
        let dir = tempfile::tempdir().unwrap();
        let src_path = dir.path().join("src.bin");
        let dst_path = dir.path().join("dst.bin");
        std::fs::write(&src_path, b"actual content").unwrap();

        let chunks = manual_chunks(&[14]);
        let mut manifest = make_manifest(14, chunks);
        manifest.file_hash = Some(crate::verify::hash_buf(b"wrong expected content"));

        let store = Arc::new(ManifestStore::new(dir.path().join("manifests")));
        let config = TransferConfig::default();
        let progress = Arc::new(ProgressTracker::new(14));
        let engine = TransferEngine::new(
            config,
            store,
            progress,
            Arc::new(NoOpSink),
            14,
            Arc::new(AtomicBool::new(false)),
        );

        let src_for_source = src_path.clone();
        let dst_for_dest = dst_path.clone();
        let task_id = manifest.task_id.clone();
        let handles = EngineHandles {
            make_source: Box::new(move || {
                Ok(Box::new(LocalIo::open_source(&src_for_source)?) as Box<dyn Capability>)
            }),
            make_dest: Box::new(move || {
                Ok(Box::new(LocalIo::open_staging(&dst_for_dest, "task1")?) as Box<dyn Capability>)
            }),
        };
        let finalizer = Box::new(LocalIo::open_staging(&dst_path, &task_id).unwrap());

        let err = engine.run(manifest, handles, finalizer, None).unwrap_err();
        assert!(matches!(err, TransferError::IntegrityError { .. }));

        // a failed integrity check must never publish the staging file.
        assert!(!dst_path.exists());
    }

    #[test]
    fn jittered_backoff_grows_exponentially_within_tolerance() {
        let d1 = jittered_backoff(1.0, 1).as_secs_f64();
        let d2 = jittered_backoff(1.0, 2).as_secs_f64();
        // attempt 1 ~ [0.8, 1.2], attempt 2 ~ [1.6, 2.4] -- disjoint ranges.
        assert!(d1 <= 1.21);
        assert!(d2 >= 1.59);
    }
}
