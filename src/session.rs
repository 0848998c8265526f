/// Per-consumer session lifecycle: a scoped namespace inside the runtime's
/// globals plus redirected standard streams.
///
/// State machine per manager: `Inactive -> Active -> Inactive`, driven only
/// by `enter`/`leave`, which are crate-private and reachable solely through
/// [`RuntimeGuard`](crate::guard::RuntimeGuard); the guard always holds the
/// execution lock first and passes its ticket down as proof. At most one
/// session is active per manager; re-entering while active is a defined
/// non-error outcome that performs no mutation, so the saved stream handles
/// can never be double-saved and leaked.
use crate::lock::LockTicket;
use crate::observability::{self, GateEventKind};
use crate::runtime::engine::{ObjectHandle, ScriptRuntime, StreamBinding, Value};
use crate::types::{HostIo, InputHandle, OutputHandle, SessionStreams};
use log::{debug, warn};
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

/// Outcome of a session entry attempt.
///
/// An explicit tri-state instead of an overloaded boolean: the caller's guard
/// needs to distinguish "I own this session" from both "someone else does"
/// and "the runtime is going away".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEntry {
    /// This call activated the session; the caller owns teardown.
    Entered,
    /// A session was already active; nothing was mutated and the caller must
    /// not tear it down.
    AlreadyActive,
    /// The runtime's execution context is no longer obtainable.
    Failed,
}

/// Host object references exported into the runtime namespace when a guard
/// requests globals initialization.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostContext {
    pub debugger: Option<ObjectHandle>,
    pub target: Option<ObjectHandle>,
    pub process: Option<ObjectHandle>,
    pub thread: Option<ObjectHandle>,
    pub frame: Option<ObjectHandle>,
}

const HOST_BINDING_KEYS: [&str; 5] = ["debugger", "target", "process", "thread", "frame"];

struct SessionInner {
    active: bool,
    /// Stream bindings in effect before this session rebound them.
    /// `None` means the slot was left untouched and there is nothing to
    /// restore.
    saved_stdin: Option<StreamBinding<InputHandle>>,
    saved_stdout: Option<StreamBinding<OutputHandle>>,
    saved_stderr: Option<StreamBinding<OutputHandle>>,
}

/// One instance per embedded-runtime consumer, long-lived relative to
/// individual calls.
pub struct SessionManager {
    consumer: String,
    consumer_id: String,
    namespace: String,
    default_io: HostIo,
    host_context: Mutex<HostContext>,
    inner: Mutex<SessionInner>,
}

impl SessionManager {
    pub fn new(consumer: &str, default_io: HostIo) -> Self {
        Self {
            consumer: consumer.to_string(),
            consumer_id: Uuid::new_v4().to_string(),
            namespace: format!("{consumer}_dict"),
            default_io,
            host_context: Mutex::new(HostContext::default()),
            inner: Mutex::new(SessionInner {
                active: false,
                saved_stdin: None,
                saved_stdout: None,
                saved_stderr: None,
            }),
        }
    }

    /// Name of the session dictionary inside the runtime's globals.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    pub fn is_active(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .active
    }

    /// Update the host references exported on globals-init entry.
    pub fn set_host_context(&self, context: HostContext) {
        *self
            .host_context
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = context;
    }

    /// Activate the session: namespace setup, convenience bindings, stdio
    /// save-and-rebind, stale-error cleanup.
    ///
    /// Requires the execution lock; the ticket parameter is the proof.
    pub(crate) fn enter(
        &self,
        runtime: &ScriptRuntime,
        _ticket: &LockTicket,
        init_globals: bool,
        no_stdin: bool,
        streams: &SessionStreams,
    ) -> SessionEntry {
        if !runtime.context_valid() {
            warn!("session entry for {} refused: runtime shut down", self.consumer);
            observability::emit(GateEventKind::SessionFailed, Some(self.consumer.as_str()), None);
            return SessionEntry::Failed;
        }

        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.active {
            // Already entered without having officially left; nothing to do.
            debug!("session for {} already active, skipping entry", self.consumer);
            observability::emit(GateEventKind::SessionSkipped, Some(self.consumer.as_str()), None);
            return SessionEntry::AlreadyActive;
        }
        inner.active = true;

        runtime.ensure_namespace(&self.namespace);
        runtime.bind_in_namespace(
            &self.namespace,
            "debugger_id",
            Value::Str(self.consumer_id.clone()),
        );

        let context = *self
            .host_context
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // The debugger reference is always refreshed; the rest only when the
        // guard asked for globals initialization.
        Self::bind_host_ref(runtime, "debugger", context.debugger);
        if init_globals {
            Self::bind_host_ref(runtime, "target", context.target);
            Self::bind_host_ref(runtime, "process", context.process);
            Self::bind_host_ref(runtime, "thread", context.thread);
            Self::bind_host_ref(runtime, "frame", context.frame);
        }

        if no_stdin {
            inner.saved_stdin = None;
        } else {
            let chosen = streams
                .stdin
                .clone()
                .unwrap_or_else(|| self.default_io.stdin.clone());
            inner.saved_stdin = Some(runtime.swap_stdin(StreamBinding::Redirected(chosen)));
        }

        let out = streams
            .stdout
            .clone()
            .unwrap_or_else(|| self.default_io.stdout.clone());
        inner.saved_stdout = Some(runtime.swap_stdout(StreamBinding::Redirected(out)));

        let err = streams
            .stderr
            .clone()
            .unwrap_or_else(|| self.default_io.stderr.clone());
        inner.saved_stderr = Some(runtime.swap_stderr(StreamBinding::Redirected(err)));

        runtime.clear_pending_error();

        observability::emit(GateEventKind::SessionEntered, Some(self.consumer.as_str()), None);
        SessionEntry::Entered
    }

    /// Deactivate the session: clear exported host references, restore saved
    /// streams (unless the execution context was concurrently torn down), and
    /// flip back to inactive.
    ///
    /// Requires the execution lock; the ticket parameter is the proof.
    /// Returns false if no session was active (caller bug, logged not fatal).
    pub(crate) fn leave(&self, runtime: &ScriptRuntime, _ticket: &LockTicket) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if !inner.active {
            warn!("leave called for {} with no active session", self.consumer);
            return false;
        }

        // Stale host references must not outlive the call even on the
        // shutdown path.
        for key in HOST_BINDING_KEYS {
            runtime.clear_global(key);
        }

        let saved_stdin = inner.saved_stdin.take();
        let saved_stdout = inner.saved_stdout.take();
        let saved_stderr = inner.saved_stderr.take();

        if runtime.context_valid() {
            if let Some(prev) = saved_stdin {
                runtime.swap_stdin(prev);
            }
            if let Some(prev) = saved_stdout {
                runtime.swap_stdout(prev);
            }
            if let Some(prev) = saved_stderr {
                runtime.swap_stderr(prev);
            }
        } else {
            // Process shutdown already invalidated the execution context;
            // touching stream state now could crash mid-teardown.
            debug!(
                "skipping stream restoration for {}: context torn down",
                self.consumer
            );
        }

        inner.active = false;
        observability::emit(GateEventKind::SessionLeft, Some(self.consumer.as_str()), None);
        true
    }

    fn bind_host_ref(runtime: &ScriptRuntime, key: &str, handle: Option<ObjectHandle>) {
        match handle {
            Some(h) => runtime.bind_global(key, Value::Object(h)),
            None => runtime.clear_global(key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::ExecLock;
    use std::sync::{Arc, Mutex};

    fn test_io() -> (Arc<Mutex<Vec<u8>>>, HostIo) {
        let out = Arc::new(Mutex::new(Vec::new()));
        let io = HostIo {
            stdin: Arc::new(Mutex::new(std::io::Cursor::new(Vec::<u8>::new()))),
            stdout: out.clone(),
            stderr: Arc::new(Mutex::new(Vec::<u8>::new())),
        };
        (out, io)
    }

    fn ready_runtime() -> ScriptRuntime {
        let rt = ScriptRuntime::new();
        rt.run_engine_init();
        rt
    }

    #[test]
    fn enter_then_leave_round_trips_state() {
        let rt = ready_runtime();
        let lock = ExecLock::new();
        let (_, io) = test_io();
        let mgr = SessionManager::new("dbg", io);

        let ticket = lock.acquire();
        assert_eq!(
            mgr.enter(&rt, &ticket, false, false, &SessionStreams::default()),
            SessionEntry::Entered
        );
        assert!(mgr.is_active());
        assert!(rt.stdout_is_redirected());

        assert!(mgr.leave(&rt, &ticket));
        assert!(!mgr.is_active());
        assert!(!rt.stdout_is_redirected());
        lock.release(ticket);
    }

    #[test]
    fn second_enter_is_already_active_and_mutates_nothing() {
        let rt = ready_runtime();
        let lock = ExecLock::new();
        let (_, io) = test_io();
        let mgr = SessionManager::new("dbg", io);

        let ticket = lock.acquire();
        assert_eq!(
            mgr.enter(&rt, &ticket, false, false, &SessionStreams::default()),
            SessionEntry::Entered
        );

        // Simulated re-entry bug: no intervening leave.
        let (buf, handle) = {
            let buf = Arc::new(Mutex::new(Vec::<u8>::new()));
            let handle: crate::types::OutputHandle = buf.clone();
            (buf, handle)
        };
        let streams = SessionStreams {
            stdout: Some(handle),
            ..Default::default()
        };
        assert_eq!(
            mgr.enter(&rt, &ticket, false, false, &streams),
            SessionEntry::AlreadyActive
        );

        // The second entry did not rebind stdout to its handle.
        rt.write_stdout(b"x").unwrap();
        assert!(buf.lock().unwrap().is_empty());

        // A single leave restores the original (non-redirected) binding.
        assert!(mgr.leave(&rt, &ticket));
        assert!(!rt.stdout_is_redirected());
        lock.release(ticket);
    }

    #[test]
    fn enter_fails_after_shutdown() {
        let rt = ready_runtime();
        let lock = ExecLock::new();
        let (_, io) = test_io();
        let mgr = SessionManager::new("dbg", io);

        rt.begin_shutdown();
        let ticket = lock.acquire();
        assert_eq!(
            mgr.enter(&rt, &ticket, false, false, &SessionStreams::default()),
            SessionEntry::Failed
        );
        assert!(!mgr.is_active());
        lock.release(ticket);
    }

    #[test]
    fn leave_after_shutdown_skips_stream_restoration() {
        let rt = ready_runtime();
        let lock = ExecLock::new();
        let (_, io) = test_io();
        let mgr = SessionManager::new("dbg", io);

        let ticket = lock.acquire();
        mgr.enter(&rt, &ticket, false, false, &SessionStreams::default());
        assert!(rt.stdout_is_redirected());

        rt.begin_shutdown();
        assert!(mgr.leave(&rt, &ticket));
        // Restoration was skipped; the redirected binding is left in place.
        assert!(rt.stdout_is_redirected());
        assert!(!mgr.is_active());
        lock.release(ticket);
    }

    #[test]
    fn globals_init_binds_and_leave_clears_host_refs() {
        let rt = ready_runtime();
        let lock = ExecLock::new();
        let (_, io) = test_io();
        let mgr = SessionManager::new("dbg", io);

        let ticket = lock.acquire();
        let target = rt.register_object("target");
        mgr.set_host_context(HostContext {
            target: Some(target),
            ..Default::default()
        });

        mgr.enter(&rt, &ticket, true, true, &SessionStreams::default());
        assert_eq!(rt.global("target"), Some(Value::Object(target)));
        // no_stdin left the input slot alone.
        assert!(rt
            .namespace_get(mgr.namespace(), "debugger_id")
            .is_some());

        mgr.leave(&rt, &ticket);
        assert_eq!(rt.global("target"), None);
        lock.release(ticket);
    }
}
