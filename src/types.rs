/// Core types and structures for the scriptgate system
use serde::Serialize;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Readable stream handle accepted at the host I/O boundary.
///
/// The crate treats these opaquely: it reads, writes and flushes them and
/// never interprets their contents.
pub type InputHandle = Arc<Mutex<dyn Read + Send>>;

/// Writable stream handle accepted at the host I/O boundary.
pub type OutputHandle = Arc<Mutex<dyn Write + Send>>;

/// A consumer's default standard streams.
///
/// Session entry falls back to these when a caller does not supply its own
/// handle for a given stream.
#[derive(Clone)]
pub struct HostIo {
    pub stdin: InputHandle,
    pub stdout: OutputHandle,
    pub stderr: OutputHandle,
}

impl HostIo {
    /// Default streams wired to the process's own stdio.
    pub fn process() -> Self {
        Self {
            stdin: Arc::new(Mutex::new(std::io::stdin())),
            stdout: Arc::new(Mutex::new(std::io::stdout())),
            stderr: Arc::new(Mutex::new(std::io::stderr())),
        }
    }
}

impl std::fmt::Debug for HostIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostIo").finish_non_exhaustive()
    }
}

/// Optional per-session stream overrides.
///
/// Each stream is independently optional; a missing handle falls back to the
/// session manager's `HostIo` defaults.
#[derive(Clone, Default)]
pub struct SessionStreams {
    pub stdin: Option<InputHandle>,
    pub stdout: Option<OutputHandle>,
    pub stderr: Option<OutputHandle>,
}

impl std::fmt::Debug for SessionStreams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStreams")
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}

/// Custom error types for scriptgate
#[derive(Error, Debug)]
pub enum GateError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("execution interrupted at checkpoint")]
    Interrupted,

    #[error("session error: {0}")]
    Session(String),

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("runtime execution context is no longer valid")]
    Shutdown,
}

/// Result type alias for scriptgate operations
pub type Result<T> = std::result::Result<T, GateError>;

/// Point-in-time snapshot of the gate's components.
///
/// Assembled from live counters; serializable for the status CLI and for
/// operators scraping logs.
#[derive(Debug, Clone, Serialize)]
pub struct GateStatus {
    pub initialized: bool,
    pub bootstrap_runs: u32,
    pub engine_inits: u32,
    pub lock_held: bool,
    pub lock_acquisitions: u64,
    pub lock_contentions: u64,
    pub session_active: bool,
    pub interrupts_posted: u64,
}

impl GateStatus {
    pub fn collect(
        runtime: &crate::runtime::engine::ScriptRuntime,
        lock: &crate::lock::ExecLock,
        session: Option<&crate::session::SessionManager>,
    ) -> Self {
        let stats = lock.stats();
        Self {
            initialized: runtime.is_initialized(),
            bootstrap_runs: runtime.bootstrap_runs(),
            engine_inits: runtime.engine_inits(),
            lock_held: stats.held,
            lock_acquisitions: stats.acquisitions,
            lock_contentions: stats.contentions,
            session_active: session.map(|s| s.is_active()).unwrap_or(false),
            interrupts_posted: runtime.interrupts_posted(),
        }
    }
}
