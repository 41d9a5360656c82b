//! SSH session setup and the SFTP-backed `Capability` implementation.
//!
//! Each worker thread gets its own authenticated `ssh2::Session` rather than
//! sharing one across threads: libssh2 serializes all I/O on a session
//! internally, so handing out one session per channel is both the safe
//! implementation and the spec's documented fallback when a server refuses
//! to multiplex additional channels onto an already-open session.

use crate::error::{Result, TransferError};
use crate::transfer::{Capability, RemoteStat};
use ssh2::{FileStat, OpenFlags, OpenType, RenameFlags, Session, Sftp};
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where and how to reach a remote endpoint.
#[derive(Debug, Clone)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub key_file: Option<PathBuf>,
    pub password: Option<String>,
    pub timeout: Duration,
}

/// Opens authenticated sessions on demand. A trait so the engine can be
/// tested against a fake without a live SSH server.
pub trait SessionFactory: Send + Sync {
    fn connect(&self) -> Result<Session>;
}

pub struct Ssh2SessionFactory {
    config: SshConfig,
}

impl Ssh2SessionFactory {
    pub fn new(config: SshConfig) -> Self {
        Ssh2SessionFactory { config }
    }
}

impl SessionFactory for Ssh2SessionFactory {
    fn connect(&self) -> Result<Session> {
        connect_and_authenticate(&self.config)
    }
}

fn connect_and_authenticate(config: &SshConfig) -> Result<Session> {
    let addr = format!("{}:{}", config.host, config.port);
    let tcp = TcpStream::connect(&addr).map_err(|source| TransferError::ConnectError {
        host: config.host.clone(),
        port: config.port,
        source,
    })?;
    tcp.set_read_timeout(Some(config.timeout)).ok();
    tcp.set_write_timeout(Some(config.timeout)).ok();

    let mut session = Session::new().map_err(TransferError::Ssh)?;
    session.set_tcp_stream(tcp);
    session.set_timeout(config.timeout.as_millis() as u32);
    session.handshake().map_err(|e| auth_error(config, e))?;

    authenticate(&mut session, config)?;

    if !session.authenticated() {
        return Err(TransferError::AuthError {
            host: config.host.clone(),
            reason: "server rejected all authentication methods".to_string(),
        });
    }

    Ok(session)
}

fn authenticate(session: &mut Session, config: &SshConfig) -> Result<()> {
    if let Some(key_file) = &config.key_file {
        session
            .userauth_pubkey_file(&config.user, None, key_file, None)
            .map_err(|e| auth_error(config, e))?;
        return Ok(());
    }

    // Try the running agent first (SSH_AUTH_SOCK), matching `ssh`'s own
    // default before falling back to a password.
    if session.userauth_agent(&config.user).is_ok() && session.authenticated() {
        return Ok(());
    }

    if let Some(password) = &config.password {
        session
            .userauth_password(&config.user, password)
            .map_err(|e| auth_error(config, e))?;
        return Ok(());
    }

    Err(TransferError::AuthError {
        host: config.host.clone(),
        reason: "no key file, agent identity, or password available".to_string(),
    })
}

fn auth_error(config: &SshConfig, source: ssh2::Error) -> TransferError {
    TransferError::AuthError {
        host: config.host.clone(),
        reason: source.to_string(),
    }
}

/// Query `$HOME` on the remote over a plain command channel, used to expand
/// `~` in remote endpoint paths. Falls back to the SFTP-normalized CWD.
pub fn remote_home(session: &Session, sftp: &Sftp) -> Result<String> {
    if let Ok(home) = exec_capture(session, "echo -n $HOME") {
        let home = home.trim().to_string();
        if !home.is_empty() {
            return Ok(home);
        }
    }
    let cwd = sftp.realpath(Path::new("."))?;
    Ok(cwd.to_string_lossy().into_owned())
}

fn exec_capture(session: &Session, command: &str) -> Result<String> {
    let mut channel = session.channel_session()?;
    channel.exec(command)?;
    let mut output = String::new();
    channel.read_to_string(&mut output)?;
    channel.wait_close()?;
    Ok(output)
}

/// SFTP-backed side of a transfer: remote source (read-only) or remote
/// destination (staged, then renamed into place on `finalize`).
///
/// Holds the `Session` alongside the `Sftp` handle even though nothing
/// calls into it directly: `ssh2`'s raw libssh2 bindings require the
/// session that created an `Sftp` subsystem to outlive it, and that isn't
/// enforced by Rust's borrow checker across this boundary.
pub struct RemoteIo {
    _session: Session,
    sftp: Sftp,
    source_path: Option<PathBuf>,
    staging_path: PathBuf,
    final_path: PathBuf,
}

impl RemoteIo {
    pub fn open_source(session: Session, sftp: Sftp, path: &Path) -> Self {
        RemoteIo {
            _session: session,
            sftp,
            source_path: Some(path.to_path_buf()),
            staging_path: path.to_path_buf(),
            final_path: path.to_path_buf(),
        }
    }

    pub fn open_staging(session: Session, sftp: Sftp, final_path: &Path, task_id: &str) -> Result<Self> {
        let staging_path = crate::transfer::staging_path_for(final_path, task_id);
        // Ensure the staging file exists; subsequent writes seek+write into it.
        let flags = OpenFlags::WRITE | OpenFlags::CREATE;
        sftp.open_mode(&staging_path, flags, 0o644, OpenType::File)?;
        Ok(RemoteIo {
            _session: session,
            sftp,
            source_path: None,
            staging_path,
            final_path: final_path.to_path_buf(),
        })
    }

    pub fn staging_path(&self) -> &Path {
        &self.staging_path
    }
}

impl Capability for RemoteIo {
    fn read_range(&mut self, offset: u64, size: u64) -> Result<Vec<u8>> {
        let path = self.source_path.as_deref().unwrap_or(&self.staging_path);
        let mut file = self.sftp.open(path)?;
        file.seek(SeekFrom::Start(offset))?;

        let mut buf = vec![0u8; size as usize];
        let mut read_total = 0usize;
        while read_total < buf.len() {
            let n = file.read(&mut buf[read_total..])?;
            if n == 0 {
                break;
            }
            read_total += n;
        }
        buf.truncate(read_total);
        Ok(buf)
    }

    fn write_range(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let flags = OpenFlags::WRITE | OpenFlags::CREATE;
        let mut file = self
            .sftp
            .open_mode(&self.staging_path, flags, 0o644, OpenType::File)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn stat(&mut self) -> Result<RemoteStat> {
        let path = self.source_path.as_deref().unwrap_or(&self.final_path);
        let stat = self.sftp.stat(path)?;
        Ok(RemoteStat {
            size: stat.size.unwrap_or(0),
            mtime: stat.mtime.unwrap_or(0) as f64,
            mode: stat.perm,
        })
    }

    fn finalize(&mut self, mode: Option<u32>) -> Result<()> {
        if let Some(mode) = mode {
            let stat = FileStat {
                size: None,
                uid: None,
                gid: None,
                perm: Some(mode),
                atime: None,
                mtime: None,
            };
            self.sftp.setstat(&self.staging_path, stat)?;
        }

        // Some SFTP servers refuse a rename onto an existing file without
        // the overwrite flag; the destination may already exist from a
        // previous failed run's partial publish.
        let _ = self.sftp.unlink(&self.final_path);
        self.sftp
            .rename(&self.staging_path, &self.final_path, Some(RenameFlags::OVERWRITE))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssh_config_defaults_are_explicit() {
        let cfg = SshConfig {
            host: "example.com".to_string(),
            port: 22,
            user: "alice".to_string(),
            key_file: None,
            password: None,
            timeout: Duration::from_secs(30),
        };
        assert_eq!(cfg.port, 22);
        assert_eq!(cfg.timeout, Duration::from_secs(30));
    }
}
