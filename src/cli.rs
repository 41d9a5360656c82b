//! Command-line surface: `rscp transfer <src> <dst> [flags]`.

use crate::config::TransferConfig;
use crate::error::TransferError;
use crate::service::SshAuth;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "rscp", version, about = "Resumable, parallel, integrity-checked file transfer over SSH")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Transfer a single file between a local path and a remote host.
    Transfer(TransferArgs),
}

#[derive(Parser, Debug)]
pub struct TransferArgs {
    /// `[user@]host:path` or a local path.
    pub src: String,
    /// `[user@]host:path` or a local path.
    pub dst: String,

    /// SSH port.
    #[arg(short = 'P', long = "port", default_value_t = 22)]
    pub port: u16,

    /// Preserve source file mode bits on the destination.
    #[arg(short = 'p')]
    pub preserve: bool,

    /// Verbose logging.
    #[arg(short = 'v')]
    pub verbose: bool,

    /// Quiet logging.
    #[arg(short = 'q')]
    pub quiet: bool,

    /// Reserved: compression (accepted, currently a no-op).
    #[arg(short = 'C')]
    pub compress: bool,

    /// Rate cap; accepts a `K`/`M`/`G` suffix, e.g. `10M`.
    #[arg(short = 'l', long = "limit-rate")]
    pub limit_rate: Option<String>,

    /// Resume from an existing manifest if one is valid.
    #[arg(long = "resume", default_value_t = true, overrides_with = "no_resume")]
    pub resume: bool,
    #[arg(long = "no-resume", overrides_with = "resume")]
    pub no_resume: bool,

    /// Discard any existing manifest and destination, start fresh.
    #[arg(long)]
    pub force: bool,

    /// Maximum concurrent chunk workers.
    #[arg(long, default_value_t = 4)]
    pub parallel: usize,

    /// Aggressive profile: smaller chunks, higher parallelism.
    #[arg(long)]
    pub aria2: bool,

    /// Aria2 chunk count hint (accepted; informational only).
    #[arg(long, default_value_t = 32)]
    pub split: usize,

    /// Chunk size override; accepts a `K`/`M` suffix.
    #[arg(long = "chunk")]
    pub chunk: Option<String>,

    /// Path to an SSH private key file.
    #[arg(long = "identity", short = 'i')]
    pub identity: Option<PathBuf>,

    /// Recursive transfer -- rejected, exit code 2.
    #[arg(short = 'r')]
    pub recursive: bool,
}

impl TransferArgs {
    pub fn resume_effective(&self) -> bool {
        self.resume && !self.no_resume
    }

    pub fn log_level(&self) -> &'static str {
        if self.quiet {
            "error"
        } else if self.verbose {
            "debug"
        } else {
            "info"
        }
    }

    /// Validate CLI-only constraints (recursive transfer, conflicting
    /// flags) and build the engine-facing config. A validation failure maps
    /// to exit code 2 ("invalid arguments"), distinct from any
    /// `TransferError` the engine itself might raise.
    pub fn to_config(&self) -> Result<TransferConfig, String> {
        if self.recursive {
            return Err("recursive transfer (-r) is not supported".to_string());
        }
        if self.verbose && self.quiet {
            return Err("-v and -q are mutually exclusive".to_string());
        }

        let limit_rate = self
            .limit_rate
            .as_deref()
            .map(parse_byte_size)
            .transpose()?;
        let chunk_size = self.chunk.as_deref().map(parse_byte_size).transpose()?;

        Ok(TransferConfig {
            resume: self.resume_effective(),
            force: self.force,
            parallel: self.parallel,
            aria2: self.aria2,
            chunk_size,
            preserve_permissions: self.preserve,
            limit_rate,
            ssh_port: self.port,
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_delay: 1.0,
        })
    }

    pub fn ssh_auth(&self) -> SshAuth {
        SshAuth {
            key_file: self.identity.clone(),
            password: std::env::var("RSCP_PASSWORD").ok(),
        }
    }
}

/// Parse a byte count with an optional trailing `K`/`M`/`G` suffix
/// (base-1024, case-insensitive).
pub fn parse_byte_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty byte size".to_string());
    }

    let (digits, multiplier) = match s.chars().last().unwrap().to_ascii_uppercase() {
        'K' => (&s[..s.len() - 1], 1024u64),
        'M' => (&s[..s.len() - 1], 1024 * 1024),
        'G' => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1),
    };

    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|_| format!("invalid byte size: {s:?}"))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("byte size overflow: {s:?}"))
}

/// Map an exit-code-carrying outcome to a process exit code, matching the
/// CLI surface's documented codes (0 success, 2 invalid args handled by the
/// caller, others from `TransferError::exit_code`).
pub fn exit_code_for_error(err: &TransferError) -> i32 {
    err.exit_code()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_number() {
        assert_eq!(parse_byte_size("1024").unwrap(), 1024);
    }

    #[test]
    fn parses_k_suffix() {
        assert_eq!(parse_byte_size("4K").unwrap(), 4096);
    }

    #[test]
    fn parses_m_suffix_case_insensitive() {
        assert_eq!(parse_byte_size("4m").unwrap(), 4 * 1024 * 1024);
    }

    #[test]
    fn parses_g_suffix() {
        assert_eq!(parse_byte_size("2G").unwrap(), 2 * 1024 * 1024 * 1024);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_byte_size("not-a-size").is_err());
    }

    #[test]
    fn rejects_empty() {
        assert!(parse_byte_size("").is_err());
    }

    #[test]
    fn resume_effective_defaults_true() {
        let args = TransferArgs {
            src: "a".into(),
            dst: "b".into(),
            port: 22,
            preserve: false,
            verbose: false,
            quiet: false,
            compress: false,
            limit_rate: None,
            resume: true,
            no_resume: false,
            force: false,
            parallel: 4,
            aria2: false,
            split: 32,
            chunk: None,
            identity: None,
            recursive: false,
        };
        assert!(args.resume_effective());
    }

    #[test]
    fn no_resume_flag_overrides_default() {
        let mut args = TransferArgs {
            src: "a".into(),
            dst: "b".into(),
            port: 22,
            preserve: false,
            verbose: false,
            quiet: false,
            compress: false,
            limit_rate: None,
            resume: true,
            no_resume: true,
            force: false,
            parallel: 4,
            aria2: false,
            split: 32,
            chunk: None,
            identity: None,
            recursive: false,
        };
        assert!(!args.resume_effective());
        args.no_resume = false;
        assert!(args.resume_effective());
    }

    #[test]
    fn recursive_flag_rejected_in_config() {
        let mut args = TransferArgs {
            src: "a".into(),
            dst: "b".into(),
            port: 22,
            preserve: false,
            verbose: false,
            quiet: false,
            compress: false,
            limit_rate: None,
            resume: true,
            no_resume: false,
            force: false,
            parallel: 4,
            aria2: false,
            split: 32,
            chunk: None,
            identity: None,
            recursive: true,
        };
        assert!(args.to_config().is_err());
        args.recursive = false;
        assert!(args.to_config().is_ok());
    }
}
