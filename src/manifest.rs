//! Manifest persistence: per-task JSON documents that make a transfer
//! resumable, plus the exclusive lock file that keeps two engines from
//! touching the same task concurrently.

use crate::chunk::{validate_chunks, Chunk};
use crate::endpoint::Endpoint;
use crate::error::{Result, TransferError};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const MANIFEST_VERSION: &str = "2.0";
const MTIME_TOLERANCE_SECS: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestConfig {
    pub parallel: usize,
    pub aria2: bool,
    /// The task's actual resolved base chunk size (the same value
    /// `chunk::plan` tiled the file with), not the raw `--chunk` override --
    /// the rate limiter's burst size and a resume's retiling both depend on
    /// this being the real number, not `None` whenever `--chunk` was unset.
    pub chunk_size: u64,
}

impl ManifestConfig {
    /// Build from a resolved per-task chunk size; see `chunk::base_chunk_size`.
    pub fn new(cfg: &crate::config::TransferConfig, resolved_chunk_size: u64) -> Self {
        ManifestConfig {
            parallel: cfg.parallel,
            aria2: cfg.aria2,
            chunk_size: resolved_chunk_size,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    pub task_id: String,
    pub src: Endpoint,
    pub dst: Endpoint,
    pub file_size: u64,
    pub file_mtime: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_hash: Option<String>,
    pub chunks: Vec<Chunk>,
    pub config: ManifestConfig,
    #[serde(default)]
    pub status: TaskStatus,
    pub created_at: f64,
    pub updated_at: f64,

    /// Fields present on a loaded document that this version of the tool
    /// doesn't know about. Re-emitted verbatim on save.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for TaskStatus {
    fn default() -> Self {
        TaskStatus::Pending
    }
}

impl Manifest {
    pub fn new(
        task_id: String,
        src: Endpoint,
        dst: Endpoint,
        file_size: u64,
        file_mtime: f64,
        chunks: Vec<Chunk>,
        config: ManifestConfig,
        now: f64,
    ) -> Self {
        Manifest {
            version: MANIFEST_VERSION.to_string(),
            task_id,
            src,
            dst,
            file_size,
            file_mtime,
            file_hash: None,
            chunks,
            config,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
            extra: Map::new(),
        }
    }

    pub fn completed_chunks(&self) -> usize {
        self.chunks
            .iter()
            .filter(|c| c.status == crate::chunk::ChunkStatus::Completed)
            .count()
    }

    pub fn is_fully_completed(&self) -> bool {
        !self.chunks.is_empty() && self.completed_chunks() == self.chunks.len()
    }
}

/// Where manifests live: `$HOME/.remote/transfer`, overridable by
/// `TOOL_TRANSFER_DIR`.
pub fn default_manifest_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("TOOL_TRANSFER_DIR") {
        return Ok(PathBuf::from(dir));
    }
    let home = std::env::var("HOME")
        .map_err(|_| TransferError::Other("HOME is not set and TOOL_TRANSFER_DIR is unset".into()))?;
    Ok(PathBuf::from(home).join(".remote").join("transfer"))
}

pub struct ManifestStore {
    dir: PathBuf,
}

/// Holds the task's exclusive lock for as long as it's alive; released on
/// drop regardless of exit path (success, error, or panic unwind).
pub struct LockGuard {
    _file: File,
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Delete the path before unlocking: flock is held against the inode,
        // not the path, so unlinking first guarantees any process that opens
        // this path afterward gets a fresh, uncontended inode rather than
        // racing to lock the one we're about to release.
        let _ = fs::remove_file(&self.path);
        let _ = FileExt::unlock(&self._file);
    }
}

impl ManifestStore {
    pub fn new(dir: PathBuf) -> Self {
        ManifestStore { dir }
    }

    pub fn open_default() -> Result<Self> {
        Ok(ManifestStore::new(default_manifest_dir()?))
    }

    fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }

    fn manifest_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn tmp_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json.tmp"))
    }

    fn corrupt_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json.corrupt"))
    }

    fn lock_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json.lock"))
    }

    /// Acquire the task's exclusive lock, failing with `ConcurrentTransfer`
    /// if another process already holds it.
    pub fn acquire_lock(&self, id: &str) -> Result<LockGuard> {
        self.ensure_dir()?;
        let path = self.lock_path(id);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        file.try_lock_exclusive()
            .map_err(|_| TransferError::ConcurrentTransfer(id.to_string()))?;
        Ok(LockGuard { _file: file, path })
    }

    /// Load a manifest. Missing file -> `None`. Malformed JSON is quarantined
    /// to `<id>.json.corrupt` rather than silently discarded, and this also
    /// returns `None` so the caller starts fresh.
    pub fn load(&self, id: &str) -> Result<Option<Manifest>> {
        let path = self.manifest_path(id);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str::<Manifest>(&raw) {
            Ok(manifest) => Ok(Some(manifest)),
            Err(_) => {
                let corrupt = self.corrupt_path(id);
                fs::rename(&path, &corrupt)?;
                Ok(None)
            }
        }
    }

    /// Atomically persist a manifest: write to a sibling `.tmp` file, fsync
    /// it, then rename over the real path.
    pub fn save(&self, manifest: &Manifest) -> Result<()> {
        self.ensure_dir()?;
        let tmp = self.tmp_path(&manifest.task_id);
        let final_path = self.manifest_path(&manifest.task_id);

        let json = serde_json::to_vec_pretty(manifest)?;
        {
            let mut f = File::create(&tmp)?;
            f.write_all(&json)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &final_path)?;

        if let Ok(dir) = File::open(&self.dir) {
            let _ = dir.sync_all();
        }
        Ok(())
    }

    /// True only if the manifest is compatible with the current task: exact
    /// version match, matching file size, mtime within tolerance, matching
    /// canonicalized endpoints, and internally-consistent chunk invariants.
    pub fn validate(
        &self,
        manifest: &Manifest,
        file_size: u64,
        file_mtime: f64,
        src_canonical: &str,
        dst_canonical: &str,
        manifest_src_canonical: &str,
        manifest_dst_canonical: &str,
    ) -> bool {
        if manifest.version != MANIFEST_VERSION {
            return false;
        }
        if manifest.file_size != file_size {
            return false;
        }
        if (manifest.file_mtime - file_mtime).abs() > MTIME_TOLERANCE_SECS {
            return false;
        }
        if manifest_src_canonical != src_canonical || manifest_dst_canonical != dst_canonical {
            return false;
        }
        validate_chunks(&manifest.chunks, manifest.file_size)
    }

    /// Idempotent: delete the manifest, its lock, and any quarantined
    /// `.corrupt` sidecar.
    pub fn cleanup(&self, id: &str) -> Result<()> {
        for path in [
            self.manifest_path(id),
            self.lock_path(id),
            self.corrupt_path(id),
            self.tmp_path(id),
        ] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Enumerate every task id with a manifest on disk.
    pub fn list_all(&self) -> Result<Vec<String>> {
        self.ensure_dir()?;
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = name.strip_suffix(".json") {
                ids.push(id.to_string());
            }
        }
        Ok(ids)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
