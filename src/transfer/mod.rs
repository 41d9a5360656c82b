//! Transfer primitives shared between the local and remote (SFTP)
//! implementations: the capability trait the engine is polymorphic over,
//! and a plain local-filesystem implementation of it.

pub mod engine;
pub mod rate_limiter;

use crate::error::Result;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt as UnixFileExt;
use std::path::{Path, PathBuf};

/// Which side of the task is on the local filesystem side of the wire and
/// which is remote; a single bit on the task, per the polymorphism note.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// remote -> local
    Download,
    /// local -> remote
    Upload,
}

/// Metadata the engine needs before planning chunks.
#[derive(Debug, Clone, Copy)]
pub struct RemoteStat {
    pub size: u64,
    pub mtime: f64,
    pub mode: Option<u32>,
}

/// One side of a transfer: can be read from, written to, and (for the
/// destination side) finalized by publishing the staging file atomically.
/// The engine only ever talks to this trait, never to `std::fs` or `ssh2`
/// directly.
pub trait Capability: Send {
    fn read_range(&mut self, offset: u64, size: u64) -> Result<Vec<u8>>;
    fn write_range(&mut self, offset: u64, data: &[u8]) -> Result<()>;
    fn stat(&mut self) -> Result<RemoteStat>;
    /// Publish the staging file over the real destination path, applying
    /// `mode` first if `Some` (the `-p` preserve-permissions flag).
    fn finalize(&mut self, mode: Option<u32>) -> Result<()>;
}

/// Local-filesystem side of a transfer. Reads/writes are positional so
/// multiple worker threads can share one open handle safely (disjoint
/// offsets only).
pub struct LocalIo {
    file: File,
    source_path: Option<PathBuf>,
    staging_path: PathBuf,
    final_path: PathBuf,
}

impl LocalIo {
    /// Open (creating if absent) the staging file for a destination-side
    /// local endpoint.
    pub fn open_staging(final_path: &Path, task_id: &str) -> Result<Self> {
        let staging_path = staging_path_for(final_path, task_id);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&staging_path)?;
        Ok(LocalIo {
            file,
            source_path: None,
            staging_path,
            final_path: final_path.to_path_buf(),
        })
    }

    /// Open an existing local file read-only, as a transfer source.
    pub fn open_source(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(LocalIo {
            file,
            source_path: Some(path.to_path_buf()),
            staging_path: path.to_path_buf(),
            final_path: path.to_path_buf(),
        })
    }

    pub fn staging_path(&self) -> &Path {
        &self.staging_path
    }
}

/// Sibling staging path: `<dst_dir>/<dst_basename>.part-<task_id>`.
pub fn staging_path_for(dst: &Path, task_id: &str) -> PathBuf {
    let file_name = dst
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let staging_name = format!("{file_name}.part-{task_id}");
    match dst.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.join(staging_name),
        _ => PathBuf::from(staging_name),
    }
}

impl Capability for LocalIo {
    fn read_range(&mut self, offset: u64, size: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; size as usize];
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }

    fn write_range(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.file.write_all_at(data, offset)?;
        Ok(())
    }

    fn stat(&mut self) -> Result<RemoteStat> {
        let path = self.source_path.as_deref().unwrap_or(&self.final_path);
        let meta = std::fs::metadata(path)?;
        let mtime = meta
            .modified()?
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        let mode = {
            use std::os::unix::fs::PermissionsExt;
            Some(meta.permissions().mode())
        };
        Ok(RemoteStat {
            size: meta.len(),
            mtime,
            mode,
        })
    }

    fn finalize(&mut self, mode: Option<u32>) -> Result<()> {
        self.file.sync_all()?;
        if let Some(mode) = mode {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.staging_path, std::fs::Permissions::from_mode(mode))?;
        }
        std::fs::rename(&self.staging_path, &self.final_path)?;
        Ok(())
    }
}
