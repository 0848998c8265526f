/// Scoped access guard: the only sanctioned way into the embedded runtime.
///
/// Construction acquires the execution lock (blocking), lazily bootstraps
/// the runtime, and optionally enters a session. Destruction leaves the
/// session (only if this guard opened it) and always releases the
/// lock. The destructor is total: nothing on the drop path can panic, so
/// stacked guards in deeply nested callback chains always restore prior
/// state, error unwinding included.
use crate::config::GateConfig;
use crate::lock::{ContextToken, ExecLock, LockTicket};
use crate::runtime::bootstrap;
use crate::runtime::engine::{ObjectHandle, ScriptRuntime};
use crate::session::{SessionEntry, SessionManager};
use crate::types::{GateError, Result, SessionStreams};
use log::debug;

/// Guard acquisition options. Acquiring the lock is implicit and
/// unconditional; everything else is opt-in.
#[derive(Debug, Clone, Copy, Default)]
pub struct GuardFlags {
    /// Enter a session on the supplied manager after taking the lock.
    pub init_session: bool,
    /// Leave the session's stdin slot untouched (no redirection, nothing
    /// saved, nothing restored).
    pub no_stdin: bool,
    /// Re-export the host convenience references into the runtime globals.
    pub init_globals: bool,
    /// Leave the session when the guard is dropped. Honored only when this
    /// guard's entry actually activated the session.
    pub teardown_on_exit: bool,
}

impl GuardFlags {
    /// Lock only: no session handling at all.
    pub fn lock_only() -> Self {
        Self::default()
    }

    /// The common call-site shape: enter a session and tear it down on exit.
    pub fn session() -> Self {
        Self {
            init_session: true,
            teardown_on_exit: true,
            ..Self::default()
        }
    }

    /// Session without stdin redirection, for non-interactive evaluation.
    pub fn session_no_stdin() -> Self {
        Self {
            no_stdin: true,
            ..Self::session()
        }
    }
}

/// RAII composition of [`ExecLock`] and [`SessionManager`].
pub struct RuntimeGuard<'a> {
    runtime: &'a ScriptRuntime,
    lock: &'a ExecLock,
    session: Option<&'a SessionManager>,
    ticket: Option<LockTicket>,
    entry: Option<SessionEntry>,
    teardown: bool,
}

impl<'a> RuntimeGuard<'a> {
    /// Acquire the lock without any session handling.
    pub fn new(runtime: &'a ScriptRuntime, lock: &'a ExecLock, flags: GuardFlags) -> Self {
        Self::build(runtime, lock, None, flags, SessionStreams::default())
    }

    /// Acquire the lock and drive the session lifecycle on `session`
    /// according to `flags`.
    pub fn with_session(
        runtime: &'a ScriptRuntime,
        lock: &'a ExecLock,
        session: &'a SessionManager,
        flags: GuardFlags,
        streams: SessionStreams,
    ) -> Self {
        Self::build(runtime, lock, Some(session), flags, streams)
    }

    fn build(
        runtime: &'a ScriptRuntime,
        lock: &'a ExecLock,
        session: Option<&'a SessionManager>,
        flags: GuardFlags,
        streams: SessionStreams,
    ) -> Self {
        // First entry anywhere in the process pays for initialization.
        bootstrap::ensure_initialized(runtime, &GateConfig::default());

        let ticket = lock.acquire();

        let mut entry = None;
        let mut teardown = false;
        if flags.init_session {
            if let Some(mgr) = session {
                let outcome = mgr.enter(
                    runtime,
                    &ticket,
                    flags.init_globals,
                    flags.no_stdin,
                    &streams,
                );
                // A guard never tears down a session it did not open.
                teardown = flags.teardown_on_exit && outcome == SessionEntry::Entered;
                if flags.teardown_on_exit && !teardown {
                    debug!("session entry returned {outcome:?}; teardown suppressed");
                }
                entry = Some(outcome);
            }
        }

        Self {
            runtime,
            lock,
            session,
            ticket: Some(ticket),
            entry,
            teardown,
        }
    }

    /// Outcome of this guard's session entry, if one was attempted.
    pub fn session_entry(&self) -> Option<SessionEntry> {
        self.entry
    }

    /// Whether this guard activated the session (and will tear it down).
    pub fn owns_session(&self) -> bool {
        self.entry == Some(SessionEntry::Entered)
    }

    /// Whether this acquisition was nested inside one already held by the
    /// same thread.
    pub fn is_reentrant(&self) -> bool {
        self.ticket.as_ref().map(LockTicket::is_reentrant).unwrap_or(false)
    }

    /// Token of the call chain this guard belongs to.
    pub fn context_token(&self) -> Option<ContextToken> {
        self.ticket.as_ref().map(LockTicket::context)
    }

    /// Safe interruption point. Embedded code running under this guard polls
    /// this; it fails with [`GateError::Interrupted`] exactly once per
    /// posted cancellation signal targeted at this call chain.
    pub fn checkpoint(&self) -> Result<()> {
        if let Some(ticket) = &self.ticket {
            if self.runtime.take_interrupt(ticket.context()) {
                return Err(GateError::Interrupted);
            }
        }
        Ok(())
    }

    /// The guarded runtime. All access through this reference happens with
    /// the lock held, by construction.
    pub fn runtime(&self) -> &ScriptRuntime {
        self.runtime
    }

    // Lock-held runtime operations ------------------------------------------

    pub fn write_stdout(&self, buf: &[u8]) -> Result<()> {
        self.runtime.write_stdout(buf)
    }

    pub fn write_stderr(&self, buf: &[u8]) -> Result<()> {
        self.runtime.write_stderr(buf)
    }

    pub fn read_stdin_line(&self) -> Result<String> {
        self.runtime.read_stdin_line()
    }

    /// Register an engine-owned object and receive a handle holding one
    /// reference.
    pub fn register_object(&self, kind: &str) -> ObjectHandle {
        self.runtime.register_object(kind)
    }

    pub fn retain_object(&self, handle: ObjectHandle) -> bool {
        self.runtime.retain_object(handle)
    }

    pub fn release_object(&self, handle: ObjectHandle) -> bool {
        self.runtime.release_object(handle)
    }
}

impl Drop for RuntimeGuard<'_> {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            if self.teardown {
                if let Some(mgr) = self.session {
                    mgr.leave(self.runtime, &ticket);
                }
            }
            self.lock.release(ticket);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HostIo;
    use std::sync::{Arc, Mutex};

    fn fixtures() -> (ScriptRuntime, ExecLock, SessionManager) {
        let rt = ScriptRuntime::new();
        let lock = ExecLock::new();
        let io = HostIo {
            stdin: Arc::new(Mutex::new(std::io::Cursor::new(Vec::<u8>::new()))),
            stdout: Arc::new(Mutex::new(Vec::<u8>::new())),
            stderr: Arc::new(Mutex::new(Vec::<u8>::new())),
        };
        let mgr = SessionManager::new("dbg", io);
        (rt, lock, mgr)
    }

    #[test]
    fn guard_releases_lock_on_drop() {
        let (rt, lock, _) = fixtures();
        {
            let guard = RuntimeGuard::new(&rt, &lock, GuardFlags::lock_only());
            assert!(lock.is_held());
            assert!(!guard.is_reentrant());
        }
        assert!(!lock.is_held());
    }

    #[test]
    fn nested_guards_share_one_context() {
        let (rt, lock, _) = fixtures();
        let outer = RuntimeGuard::new(&rt, &lock, GuardFlags::lock_only());
        let token = outer.context_token();

        let inner = RuntimeGuard::new(&rt, &lock, GuardFlags::lock_only());
        assert!(inner.is_reentrant());
        assert_eq!(inner.context_token(), token);
        drop(inner);

        // Outer guard still holds; context unchanged.
        assert_eq!(lock.current_context(), token);
        drop(outer);
        assert_eq!(lock.current_context(), None);
    }

    #[test]
    fn inner_guard_does_not_teardown_outer_session() {
        let (rt, lock, mgr) = fixtures();

        let g1 = RuntimeGuard::with_session(
            &rt,
            &lock,
            &mgr,
            GuardFlags::session(),
            SessionStreams::default(),
        );
        assert!(g1.owns_session());

        let g2 = RuntimeGuard::with_session(
            &rt,
            &lock,
            &mgr,
            GuardFlags::session(),
            SessionStreams::default(),
        );
        assert_eq!(g2.session_entry(), Some(SessionEntry::AlreadyActive));
        assert!(!g2.owns_session());

        drop(g2);
        // The inner guard must not have deactivated the outer session.
        assert!(mgr.is_active());

        drop(g1);
        assert!(!mgr.is_active());
    }

    #[test]
    fn teardown_suppressed_when_entry_fails() {
        let (rt, lock, mgr) = fixtures();
        // Force the entry to fail outright.
        bootstrap::ensure_initialized(&rt, &GateConfig::default());
        rt.begin_shutdown();

        let guard = RuntimeGuard::with_session(
            &rt,
            &lock,
            &mgr,
            GuardFlags::session(),
            SessionStreams::default(),
        );
        assert_eq!(guard.session_entry(), Some(SessionEntry::Failed));
        assert!(!guard.owns_session());
        drop(guard);
        assert!(!lock.is_held());
    }

    #[test]
    fn checkpoint_observes_targeted_interrupt() {
        let (rt, lock, _) = fixtures();
        let guard = RuntimeGuard::new(&rt, &lock, GuardFlags::lock_only());
        assert!(guard.checkpoint().is_ok());

        let token = guard.context_token().unwrap();
        rt.post_interrupt(token);
        assert!(matches!(guard.checkpoint(), Err(GateError::Interrupted)));
        // Consumed exactly once.
        assert!(guard.checkpoint().is_ok());
    }

    #[test]
    fn guard_construction_bootstraps_lazily() {
        let (rt, lock, _) = fixtures();
        assert!(!rt.is_initialized());
        let _guard = RuntimeGuard::new(&rt, &lock, GuardFlags::lock_only());
        assert!(rt.is_initialized());
        assert_eq!(rt.bootstrap_runs(), 1);
    }
}
