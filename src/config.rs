//! `TransferConfig`: the knobs that drive a single `transfer` invocation,
//! independent of how they were sourced (CLI flags today; there is no
//! on-disk config file for the engine itself).

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub resume: bool,
    pub force: bool,
    pub parallel: usize,
    pub aria2: bool,
    pub chunk_size: Option<u64>,
    pub preserve_permissions: bool,
    pub limit_rate: Option<u64>,
    pub ssh_port: u16,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: f64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            resume: true,
            force: false,
            parallel: 4,
            aria2: false,
            chunk_size: None,
            preserve_permissions: false,
            limit_rate: None,
            ssh_port: 22,
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_delay: 1.0,
        }
    }
}

impl TransferConfig {
    /// Effective worker count: aria2 mode caps at 16 regardless of what was
    /// requested.
    pub fn effective_parallel(&self) -> usize {
        if self.aria2 {
            self.parallel.min(16)
        } else {
            self.parallel
        }
        .max(1)
    }
}
