//! Engine configuration.

use std::net::TcpListener;
use std::path::PathBuf;

/// Configuration for an engine and the instances it creates.
#[derive(Debug)]
pub struct EngineConfig {
    /// Guest value-stack size in 64-bit slots.
    pub stack_slots: usize,
    /// Maximum guest call depth before call-stack-exhausted.
    pub max_call_depth: u64,
    /// Directories pre-opened for the guest, in FD order starting at 3:
    /// (guest-visible path, host path).
    pub preopen_dirs: Vec<(String, PathBuf)>,
    /// TCP listeners pre-opened for the guest, after the directories.
    pub preopen_listeners: Vec<TcpListener>,
    /// Command-line arguments surfaced to the guest.
    pub args: Vec<String>,
    /// Environment variables surfaced to the guest.
    pub envs: Vec<(String, String)>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stack_slots: 64 * 1024,
            max_call_depth: 1000,
            preopen_dirs: Vec::new(),
            preopen_listeners: Vec::new(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }
}
