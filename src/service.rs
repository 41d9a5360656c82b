//! Service Orchestrator: glues endpoint parsing, manifest lifecycle, chunk
//! planning, the transfer engine, and verification into the single call a
//! CLI invocation makes.

use crate::chunk::{base_chunk_size, plan};
use crate::config::TransferConfig;
use crate::endpoint::{task_id, Endpoint};
use crate::error::{Result, TransferError};
use crate::manifest::{Manifest, ManifestConfig, ManifestStore};
use crate::progress::{ProgressSink, ProgressTracker};
use crate::ssh::{remote_home, RemoteIo, SessionFactory, Ssh2SessionFactory, SshConfig};
use crate::transfer::engine::{EngineHandles, TransferEngine, TransferResult};
use crate::transfer::{Capability, Direction, LocalIo};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// Credentials for whichever endpoint turns out to be remote; independent
/// of parsing since the CLI only learns these from separate flags.
#[derive(Debug, Clone, Default)]
pub struct SshAuth {
    pub key_file: Option<PathBuf>,
    pub password: Option<String>,
}

/// Run one `transfer` invocation end to end. On success the destination
/// exists with verified bytes and the manifest has been cleaned up; on
/// failure the staging file and manifest are left in place for a future
/// resume or inspection.
pub fn run_transfer(
    src_spec: &str,
    dst_spec: &str,
    config: TransferConfig,
    auth: SshAuth,
    sink: Arc<dyn ProgressSink>,
    cancel: Arc<AtomicBool>,
) -> Result<TransferResult> {
    let mut src = Endpoint::parse(src_spec)?;
    let mut dst = Endpoint::parse(dst_spec)?;

    let direction = match (src.is_local, dst.is_local) {
        (true, false) => Direction::Upload,
        (false, true) => Direction::Download,
        (true, true) => {
            return Err(TransferError::ParseError(
                "at least one of src/dst must be remote".to_string(),
            ))
        }
        (false, false) => {
            return Err(TransferError::ParseError(
                "cross-host transfers are not supported; one side must be local".to_string(),
            ))
        }
    };

    let remote_endpoint = if src.is_local { &mut dst } else { &mut src };
    remote_endpoint.port = config.ssh_port;
    let ssh_config = SshConfig {
        host: remote_endpoint.host.clone().unwrap_or_default(),
        port: remote_endpoint.port,
        user: remote_endpoint
            .user
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "root".to_string()),
        key_file: auth.key_file.clone(),
        password: auth.password.clone(),
        timeout: config.timeout,
    };

    let factory = Ssh2SessionFactory::new(ssh_config.clone());
    let control_session = factory.connect()?;
    let control_sftp = control_session.sftp().map_err(TransferError::Ssh)?;

    if src.is_local {
        src.resolve_home(&local_home()?);
    } else {
        let home = remote_home(&control_session, &control_sftp)?;
        src.resolve_home(&home);
    }
    if dst.is_local {
        dst.resolve_home(&local_home()?);
    } else {
        let home = remote_home(&control_session, &control_sftp)?;
        dst.resolve_home(&home);
    }

    let cwd = std::env::current_dir()?;
    let home = PathBuf::from(local_home()?);

    let (file_size, file_mtime) = stat_source(&src, &control_sftp)?;
    ensure_destination_parent_exists(&dst, &control_sftp)?;

    let id = task_id(&src, &dst, &cwd, &home);
    let store = Arc::new(ManifestStore::open_default()?);
    let _lock = store.acquire_lock(&id)?;

    let src_canonical = src.canonical_string(&cwd, &home);
    let dst_canonical = dst.canonical_string(&cwd, &home);

    if config.force {
        store.cleanup(&id)?;
    }

    let existing = if config.force { None } else { store.load(&id)? };

    let manifest = match existing {
        Some(m)
            if config.resume
                && store.validate(
                    &m,
                    file_size,
                    file_mtime,
                    &src_canonical,
                    &dst_canonical,
                    &m.src.canonical_string(&cwd, &home),
                    &m.dst.canonical_string(&cwd, &home),
                ) =>
        {
            m
        }
        _ => {
            let resolved_chunk_size = base_chunk_size(file_size, config.aria2, config.chunk_size);
            let chunks = plan(file_size, config.aria2, config.chunk_size);
            Manifest::new(
                id.clone(),
                src.clone(),
                dst.clone(),
                file_size,
                file_mtime,
                chunks,
                ManifestConfig::new(&config, resolved_chunk_size),
                now_secs(),
            )
        }
    };

    let progress = Arc::new(ProgressTracker::new(file_size));
    let burst = manifest.config.chunk_size;
    let engine = TransferEngine::new(config.clone(), store.clone(), progress, sink, burst, cancel);

    let handles = build_handles(direction, src.path.clone(), dst.path.clone(), id.clone(), ssh_config.clone());
    let finalizer = build_finalizer(direction, &src, &dst, &id, &ssh_config)?;
    let finalize_mode = if config.preserve_permissions {
        source_mode(&src, &ssh_config)?
    } else {
        None
    };

    let (final_manifest, result) = engine.run(manifest, handles, finalizer, finalize_mode)?;

    store.cleanup(&id)?;
    let _ = final_manifest;

    Ok(result)
}

fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn local_home() -> Result<String> {
    std::env::var("HOME")
        .map_err(|_| TransferError::Other("HOME is not set".to_string()))
}

fn stat_source(src: &Endpoint, control_sftp: &ssh2::Sftp) -> Result<(u64, f64)> {
    if src.is_local {
        let meta = std::fs::metadata(&src.path)?;
        let mtime = meta
            .modified()?
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        Ok((meta.len(), mtime))
    } else {
        let stat = control_sftp.stat(Path::new(&src.path))?;
        Ok((stat.size.unwrap_or(0), stat.mtime.unwrap_or(0) as f64))
    }
}

fn ensure_destination_parent_exists(dst: &Endpoint, control_sftp: &ssh2::Sftp) -> Result<()> {
    let path = PathBuf::from(&dst.path);
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    if dst.is_local {
        if !parent.exists() {
            return Err(TransferError::Other(format!(
                "destination directory does not exist: {}",
                parent.display()
            )));
        }
    } else if control_sftp.stat(parent).is_err() {
        return Err(TransferError::Other(format!(
            "remote destination directory does not exist: {}",
            parent.display()
        )));
    }
    Ok(())
}

fn build_handles(
    direction: Direction,
    src_path: String,
    dst_path: String,
    task_id: String,
    ssh_config: SshConfig,
) -> EngineHandles {
    match direction {
        Direction::Upload => {
            let src_path = PathBuf::from(src_path);
            let dst_path = PathBuf::from(dst_path);
            let ssh_for_dest = ssh_config;
            let task_for_dest = task_id;
            EngineHandles {
                make_source: Box::new(move || {
                    Ok(Box::new(LocalIo::open_source(&src_path)?) as Box<dyn Capability>)
                }),
                make_dest: Box::new(move || {
                    let factory = Ssh2SessionFactory::new(ssh_for_dest.clone());
                    let session = factory.connect()?;
                    let sftp = session.sftp().map_err(TransferError::Ssh)?;
                    Ok(Box::new(RemoteIo::open_staging(
                        session,
                        sftp,
                        &dst_path,
                        &task_for_dest,
                    )?) as Box<dyn Capability>)
                }),
            }
        }
        Direction::Download => {
            let src_path = PathBuf::from(src_path);
            let dst_path = PathBuf::from(dst_path);
            let ssh_for_source = ssh_config;
            EngineHandles {
                make_source: Box::new(move || {
                    let factory = Ssh2SessionFactory::new(ssh_for_source.clone());
                    let session = factory.connect()?;
                    let sftp = session.sftp().map_err(TransferError::Ssh)?;
                    Ok(Box::new(RemoteIo::open_source(session, sftp, &src_path)) as Box<dyn Capability>)
                }),
                make_dest: Box::new(move || {
                    Ok(Box::new(LocalIo::open_staging(&dst_path, &task_id)?) as Box<dyn Capability>)
                }),
            }
        }
    }
}

fn build_finalizer(
    direction: Direction,
    src: &Endpoint,
    dst: &Endpoint,
    task_id: &str,
    ssh_config: &SshConfig,
) -> Result<Box<dyn Capability>> {
    match direction {
        Direction::Upload => {
            let factory = Ssh2SessionFactory::new(ssh_config.clone());
            let session = factory.connect()?;
            let sftp = session.sftp().map_err(TransferError::Ssh)?;
            Ok(Box::new(RemoteIo::open_staging(
                session,
                sftp,
                Path::new(&dst.path),
                task_id,
            )?))
        }
        Direction::Download => {
            let _ = src;
            Ok(Box::new(LocalIo::open_staging(Path::new(&dst.path), task_id)?))
        }
    }
}

fn source_mode(src: &Endpoint, ssh_config: &SshConfig) -> Result<Option<u32>> {
    if src.is_local {
        use std::os::unix::fs::PermissionsExt;
        let meta = std::fs::metadata(&src.path)?;
        Ok(Some(meta.permissions().mode()))
    } else {
        let factory = Ssh2SessionFactory::new(ssh_config.clone());
        let session = factory.connect()?;
        let sftp = session.sftp().map_err(TransferError::Ssh)?;
        let stat = sftp.stat(Path::new(&src.path))?;
        Ok(stat.perm)
    }
}
