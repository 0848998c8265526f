/// In-process model of the embedded scripting engine.
///
/// The engine is fundamentally single-threaded: exactly one execution context
/// may be inside it at a time, and every mutating operation here assumes the
/// caller holds the [`ExecLock`](crate::lock::ExecLock). That convention is
/// enforced by construction: mutators are crate-private and only reachable
/// through the session manager and the scoped guard, both of which require a
/// lock ticket. The internal mutex exists for soundness, not for scheduling;
/// it is never contended in correct use.
use crate::lock::ContextToken;
use crate::types::{GateError, InputHandle, OutputHandle, Result};
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::io::{BufRead, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, Once, PoisonError};

/// A value bound in the engine's global namespace.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Int(i64),
    Bool(bool),
    /// Reference to an engine-owned object in the registry.
    Object(ObjectHandle),
    /// Nested namespace (e.g. a per-consumer session dictionary).
    Dict(HashMap<String, Value>),
}

/// Opaque handle to an engine-owned object referenced by the host.
///
/// Lifetime is managed with explicit retain/release calls, made only while
/// the execution lock is held. The handle itself is a plain id and may be
/// copied freely; only the registry entry is refcounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectHandle {
    id: u64,
}

impl ObjectHandle {
    pub fn id(self) -> u64 {
        self.id
    }
}

#[derive(Debug)]
struct ObjectEntry {
    kind: String,
    refs: u32,
}

/// Binding state of one standard-stream slot.
#[derive(Clone)]
pub enum StreamBinding<T> {
    /// No redirection in effect; the slot resolves to process stdio.
    HostDefault,
    Redirected(T),
}

impl<T> StreamBinding<T> {
    pub fn is_redirected(&self) -> bool {
        matches!(self, StreamBinding::Redirected(_))
    }
}

struct EngineState {
    search_paths: Vec<PathBuf>,
    globals: HashMap<String, Value>,
    stdin: StreamBinding<InputHandle>,
    stdout: StreamBinding<OutputHandle>,
    stderr: StreamBinding<OutputHandle>,
    pending_error: Option<String>,
    objects: HashMap<u64, ObjectEntry>,
}

/// The embedded runtime handle.
///
/// One logical instance per process in production; tests may instantiate
/// several independent ones. The initialized flag is set exactly once and
/// never cleared; the engine is only ever torn down implicitly at process
/// exit, by a decision outside this crate.
pub struct ScriptRuntime {
    initialized: AtomicBool,
    /// Whether threading support is active. Used by the bootstrap path to
    /// detect an engine initialized by an external embedder.
    threads_active: AtomicBool,
    /// Host began teardown; execution-context tokens are no longer
    /// obtainable and stream restoration must be skipped.
    shutdown: AtomicBool,
    bootstrap_once: Once,
    bootstrap_runs: AtomicU32,
    engine_inits: AtomicU32,
    /// Pending interrupt, keyed by context-token id (0 = none).
    pending_interrupt: AtomicU64,
    interrupts_posted: AtomicU64,
    next_object_id: AtomicU64,
    state: Mutex<EngineState>,
}

impl ScriptRuntime {
    pub fn new() -> Self {
        Self {
            initialized: AtomicBool::new(false),
            threads_active: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            bootstrap_once: Once::new(),
            bootstrap_runs: AtomicU32::new(0),
            engine_inits: AtomicU32::new(0),
            pending_interrupt: AtomicU64::new(0),
            interrupts_posted: AtomicU64::new(0),
            next_object_id: AtomicU64::new(0),
            state: Mutex::new(EngineState {
                search_paths: Vec::new(),
                globals: HashMap::new(),
                stdin: StreamBinding::HostDefault,
                stdout: StreamBinding::HostDefault,
                stderr: StreamBinding::HostDefault,
                pending_error: None,
                objects: HashMap::new(),
            }),
        }
    }

    /// A runtime that was already initialized by code outside this crate
    /// (threading support active, engine init done elsewhere). The bootstrap
    /// path must tolerate this and skip the fresh-initialization sequence.
    pub fn new_externally_initialized() -> Self {
        let rt = Self::new();
        rt.initialized.store(true, Ordering::SeqCst);
        rt.threads_active.store(true, Ordering::SeqCst);
        rt
    }

    fn state(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Initialization state --------------------------------------------------

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn threads_active(&self) -> bool {
        self.threads_active.load(Ordering::SeqCst)
    }

    pub(crate) fn bootstrap_once(&self) -> &Once {
        &self.bootstrap_once
    }

    /// Fresh engine initialization. Only the bootstrap path calls this, and
    /// only when no external embedder beat us to it.
    pub(crate) fn run_engine_init(&self) {
        self.initialized.store(true, Ordering::SeqCst);
        self.threads_active.store(true, Ordering::SeqCst);
        self.engine_inits.fetch_add(1, Ordering::SeqCst);
        debug!("engine initialized");
    }

    /// The fixed bootstrap sequence that imports the support glue.
    pub(crate) fn run_bootstrap_sequence(&self) {
        let mut state = self.state();
        state.globals.insert(
            "__scriptgate_glue__".to_string(),
            Value::Str(env!("CARGO_PKG_VERSION").to_string()),
        );
        drop(state);
        self.bootstrap_runs.fetch_add(1, Ordering::SeqCst);
    }

    /// Number of times the bootstrap sequence has run. Stays at one no matter
    /// how many threads race `ensure_initialized`.
    pub fn bootstrap_runs(&self) -> u32 {
        self.bootstrap_runs.load(Ordering::SeqCst)
    }

    /// Number of fresh engine initializations performed (zero when an
    /// external embedder initialized the engine first).
    pub fn engine_inits(&self) -> u32 {
        self.engine_inits.load(Ordering::SeqCst)
    }

    // Shutdown --------------------------------------------------------------

    /// Mark the execution context invalid. Called by the external owner when
    /// process teardown begins; from this point LeaveSession skips stream
    /// restoration instead of touching engine state that may be gone.
    pub fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        warn!("runtime shutdown flagged; execution context no longer obtainable");
    }

    /// Whether an execution-context token can still be obtained.
    pub fn context_valid(&self) -> bool {
        self.is_initialized() && !self.shutdown.load(Ordering::SeqCst)
    }

    // Module search paths ---------------------------------------------------

    pub(crate) fn prepend_search_path(&self, path: &Path) {
        self.state().search_paths.insert(0, path.to_path_buf());
    }

    pub(crate) fn append_search_path(&self, path: &Path) {
        self.state().search_paths.push(path.to_path_buf());
    }

    pub fn search_paths(&self) -> Vec<PathBuf> {
        self.state().search_paths.clone()
    }

    // Global namespace ------------------------------------------------------

    pub(crate) fn bind_global(&self, key: &str, value: Value) {
        trace!("bind global {key}");
        self.state().globals.insert(key.to_string(), value);
    }

    pub(crate) fn clear_global(&self, key: &str) {
        self.state().globals.remove(key);
    }

    pub fn global(&self, key: &str) -> Option<Value> {
        self.state().globals.get(key).cloned()
    }

    /// Create the named session dictionary if it does not exist yet.
    pub(crate) fn ensure_namespace(&self, name: &str) {
        let mut state = self.state();
        state
            .globals
            .entry(name.to_string())
            .or_insert_with(|| Value::Dict(HashMap::new()));
    }

    /// Bind a key inside a session dictionary. Returns false if the namespace
    /// does not exist or is not a dictionary.
    pub(crate) fn bind_in_namespace(&self, namespace: &str, key: &str, value: Value) -> bool {
        let mut state = self.state();
        match state.globals.get_mut(namespace) {
            Some(Value::Dict(dict)) => {
                dict.insert(key.to_string(), value);
                true
            }
            _ => false,
        }
    }

    pub fn namespace_get(&self, namespace: &str, key: &str) -> Option<Value> {
        match self.state().globals.get(namespace) {
            Some(Value::Dict(dict)) => dict.get(key).cloned(),
            _ => None,
        }
    }

    // Standard streams ------------------------------------------------------

    pub(crate) fn swap_stdin(
        &self,
        binding: StreamBinding<InputHandle>,
    ) -> StreamBinding<InputHandle> {
        std::mem::replace(&mut self.state().stdin, binding)
    }

    pub(crate) fn swap_stdout(
        &self,
        binding: StreamBinding<OutputHandle>,
    ) -> StreamBinding<OutputHandle> {
        std::mem::replace(&mut self.state().stdout, binding)
    }

    pub(crate) fn swap_stderr(
        &self,
        binding: StreamBinding<OutputHandle>,
    ) -> StreamBinding<OutputHandle> {
        std::mem::replace(&mut self.state().stderr, binding)
    }

    pub fn stdout_is_redirected(&self) -> bool {
        self.state().stdout.is_redirected()
    }

    /// Write to whatever the current output stream is bound to.
    pub(crate) fn write_stdout(&self, buf: &[u8]) -> Result<()> {
        let binding = self.state().stdout.clone();
        match binding {
            StreamBinding::Redirected(handle) => {
                let mut writer = handle.lock().unwrap_or_else(PoisonError::into_inner);
                writer.write_all(buf)?;
                writer.flush()?;
            }
            StreamBinding::HostDefault => {
                let mut out = std::io::stdout();
                out.write_all(buf)?;
                out.flush()?;
            }
        }
        Ok(())
    }

    pub(crate) fn write_stderr(&self, buf: &[u8]) -> Result<()> {
        let binding = self.state().stderr.clone();
        match binding {
            StreamBinding::Redirected(handle) => {
                let mut writer = handle.lock().unwrap_or_else(PoisonError::into_inner);
                writer.write_all(buf)?;
                writer.flush()?;
            }
            StreamBinding::HostDefault => {
                let mut err = std::io::stderr();
                err.write_all(buf)?;
                err.flush()?;
            }
        }
        Ok(())
    }

    /// Read one line from the current input stream.
    pub(crate) fn read_stdin_line(&self) -> Result<String> {
        let binding = self.state().stdin.clone();
        let mut line = String::new();
        match binding {
            StreamBinding::Redirected(handle) => {
                let mut reader = handle.lock().unwrap_or_else(PoisonError::into_inner);
                let mut byte = [0u8; 1];
                // Handles are plain readers; pull bytes until newline or EOF.
                loop {
                    match reader.read(&mut byte)? {
                        0 => break,
                        _ => {
                            line.push(byte[0] as char);
                            if byte[0] == b'\n' {
                                break;
                            }
                        }
                    }
                }
            }
            StreamBinding::HostDefault => {
                std::io::stdin()
                    .lock()
                    .read_line(&mut line)
                    .map_err(GateError::Io)?;
            }
        }
        Ok(line)
    }

    // Pending unhandled-error state -----------------------------------------

    /// Record an unhandled error left behind by embedded code. External
    /// collaborators set this; session entry clears it.
    pub fn set_pending_error(&self, message: &str) {
        self.state().pending_error = Some(message.to_string());
    }

    pub(crate) fn clear_pending_error(&self) {
        if let Some(prev) = self.state().pending_error.take() {
            debug!("cleared stale unhandled error: {prev}");
        }
    }

    pub fn pending_error(&self) -> Option<String> {
        self.state().pending_error.clone()
    }

    // Object registry -------------------------------------------------------

    /// Register a new engine-owned object and hand out a handle with one
    /// reference.
    pub(crate) fn register_object(&self, kind: &str) -> ObjectHandle {
        let id = self.next_object_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.state().objects.insert(
            id,
            ObjectEntry {
                kind: kind.to_string(),
                refs: 1,
            },
        );
        ObjectHandle { id }
    }

    /// Take an additional reference. Returns false for a dead handle.
    pub(crate) fn retain_object(&self, handle: ObjectHandle) -> bool {
        let mut state = self.state();
        match state.objects.get_mut(&handle.id) {
            Some(entry) => {
                entry.refs += 1;
                true
            }
            None => false,
        }
    }

    /// Drop one reference; the entry is removed when the count reaches zero.
    /// Returns false for a dead handle.
    pub(crate) fn release_object(&self, handle: ObjectHandle) -> bool {
        let mut state = self.state();
        let Some(entry) = state.objects.get_mut(&handle.id) else {
            warn!("release of dead object handle {}", handle.id);
            return false;
        };
        entry.refs -= 1;
        if entry.refs == 0 {
            if let Some(entry) = state.objects.remove(&handle.id) {
                trace!("object {} ({}) destroyed", handle.id, entry.kind);
            }
        }
        true
    }

    pub fn object_refs(&self, handle: ObjectHandle) -> Option<u32> {
        self.state().objects.get(&handle.id).map(|e| e.refs)
    }

    pub fn live_objects(&self) -> usize {
        self.state().objects.len()
    }

    // Interrupt mailbox -----------------------------------------------------

    /// Post an asynchronous cancellation signal targeted at one context.
    /// Observed at the next checkpoint the running flow polls; a signal that
    /// races completion is never observed because token ids are not reused.
    pub(crate) fn post_interrupt(&self, target: ContextToken) {
        self.pending_interrupt.store(target.id(), Ordering::SeqCst);
        self.interrupts_posted.fetch_add(1, Ordering::SeqCst);
    }

    /// Consume a pending interrupt aimed at `current`. Returns true exactly
    /// once per posted signal.
    pub(crate) fn take_interrupt(&self, current: ContextToken) -> bool {
        self.pending_interrupt
            .compare_exchange(current.id(), 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn interrupts_posted(&self) -> u64 {
        self.interrupts_posted.load(Ordering::SeqCst)
    }
}

impl Default for ScriptRuntime {
    fn default() -> Self {
        Self::new()
    }
}
