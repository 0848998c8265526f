//! scriptgate: concurrency and session-lifecycle management for a single
//! embedded, stateful scripting runtime shared by multiple host threads.
//!
//! # Architecture
//!
//! The runtime has exactly one execution context active at a time. Callers on
//! arbitrary host threads serialize entry through an exclusive lock,
//! optionally establish a request-scoped namespace ("session") with
//! redirected standard I/O, and tear everything down on every exit path.
//!
//! ## Runtime ([`runtime`])
//! - [`runtime::engine`]: the embedded engine model: global namespace,
//!   stream slots, object registry, interrupt mailbox
//! - [`runtime::bootstrap`]: exactly-once initialization and search-path
//!   configuration, tolerant of externally initialized engines
//!
//! ## Serialization ([`lock`])
//! - [`lock::ExecLock`]: the exclusive execution lock, reentrant per owning
//!   thread, save/restore-aware for execution-context tokens
//!
//! ## Sessions ([`session`])
//! - [`session::SessionManager`]: per-consumer namespace and
//!   stdio-redirection lifecycle, mutated only under the lock
//!
//! ## Entry point ([`guard`])
//! - [`guard::RuntimeGuard`]: the RAII façade composing lock + session; the
//!   only sanctioned way into the runtime
//!
//! ## Cancellation ([`interrupt`])
//! - [`interrupt::InterruptController`]: best-effort asynchronous
//!   cancellation, observed at checkpoints
//!
//! # Design Principles
//!
//! 1. **Pair construction with destruction** - every acquisition releases,
//!    every entered session leaves, on every path including unwinding
//! 2. **Restore, don't reset** - release restores exactly the state captured
//!    at acquisition, never a global default
//! 3. **Ownership decides teardown** - a guard never leaves a session it did
//!    not open
//! 4. **Statuses, not errors** - already-active, nothing-to-interrupt and
//!    missing-stream outcomes are defined results, not failures

pub mod cli;
pub mod config;
pub mod guard;
pub mod interrupt;
pub mod lock;
pub mod observability;
pub mod runtime;
pub mod session;
pub mod types;

// Re-export commonly used types for convenience
pub use config::GateConfig;
pub use guard::{GuardFlags, RuntimeGuard};
pub use interrupt::InterruptController;
pub use lock::{ContextToken, ExecLock, LockStats, LockTicket};
pub use runtime::bootstrap::ensure_initialized;
pub use runtime::engine::{ObjectHandle, ScriptRuntime, StreamBinding, Value};
pub use session::{HostContext, SessionEntry, SessionManager};
pub use types::{
    GateError, GateStatus, HostIo, InputHandle, OutputHandle, Result, SessionStreams,
};
