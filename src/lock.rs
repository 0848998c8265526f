/// Exclusive, save/restore-aware lock guarding the single embedded execution
/// context.
///
/// The underlying primitive is a plain mutex/condvar pair, which is not
/// natively reentrant. Reentrancy per logical flow is layered on top with
/// owner/depth bookkeeping: an acquisition from the thread that already owns
/// the lock is immediate and produces a ticket flagged as reentrant. The
/// ticket also records the execution-context token that was current
/// immediately before the acquisition, so release can restore exactly that
/// state rather than some global default.
use log::{debug, warn};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::thread::{self, ThreadId};

/// Opaque identifier for "which logical call stack is currently running
/// inside the runtime". Ids are allocated monotonically and never reused, so
/// a stale token can never be mistaken for a live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextToken(u64);

impl ContextToken {
    pub(crate) fn id(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ContextToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Proof of a single acquisition of [`ExecLock`].
///
/// Created by `acquire`, consumed by `release`, owned exclusively by the
/// guard that created it. Not `Clone`: one ticket, one release.
#[derive(Debug)]
pub struct LockTicket {
    /// The calling thread already owned the lock when this ticket was issued.
    reentrant: bool,
    /// Context token that was current immediately before this acquisition.
    saved_context: Option<ContextToken>,
    /// Token current while this ticket is outstanding.
    active_context: ContextToken,
}

impl LockTicket {
    pub fn is_reentrant(&self) -> bool {
        self.reentrant
    }

    /// Token identifying the call chain this ticket belongs to.
    pub fn context(&self) -> ContextToken {
        self.active_context
    }
}

struct LockInner {
    owner: Option<ThreadId>,
    depth: u32,
    /// Token of the call chain currently inside the lock, if any.
    current: Option<ContextToken>,
}

/// Snapshot of lock counters for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct LockStats {
    pub held: bool,
    pub acquisitions: u64,
    pub contentions: u64,
}

/// The exclusive execution lock.
///
/// One instance per embedded runtime. Instances are owned and injected
/// explicitly (never hidden global state) so tests can run several
/// independent runtimes in one process.
pub struct ExecLock {
    inner: Mutex<LockInner>,
    available: Condvar,
    next_token: AtomicU64,
    acquisitions: AtomicU64,
    contentions: AtomicU64,
}

impl ExecLock {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LockInner {
                owner: None,
                depth: 0,
                current: None,
            }),
            available: Condvar::new(),
            next_token: AtomicU64::new(0),
            acquisitions: AtomicU64::new(0),
            contentions: AtomicU64::new(0),
        }
    }

    /// Block until the lock is free (or already owned by this thread), then
    /// take it.
    ///
    /// Reentrant acquisition from the owning thread never blocks and leaves
    /// the current context token unchanged. An outermost acquisition records
    /// the previously current token and installs a fresh one for the new call
    /// chain.
    pub fn acquire(&self) -> LockTicket {
        let me = thread::current().id();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        let ticket = if inner.owner == Some(me) {
            inner.depth += 1;
            let active = inner
                .current
                .expect("owned lock always has a current context");
            debug!("reentrant acquire on {active} (depth {})", inner.depth);
            LockTicket {
                reentrant: true,
                saved_context: inner.current,
                active_context: active,
            }
        } else {
            if inner.owner.is_some() {
                self.contentions.fetch_add(1, Ordering::Relaxed);
            }
            while inner.owner.is_some() {
                inner = self
                    .available
                    .wait(inner)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            let saved = inner.current;
            let token = ContextToken(self.next_token.fetch_add(1, Ordering::Relaxed) + 1);
            inner.owner = Some(me);
            inner.depth = 1;
            inner.current = Some(token);
            debug!("acquired lock, new context {token}");
            LockTicket {
                reentrant: false,
                saved_context: saved,
                active_context: token,
            }
        };

        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        ticket
    }

    /// Release one acquisition.
    ///
    /// Restores the context token recorded by this ticket; only the release
    /// that brings the depth back to zero frees the underlying primitive.
    /// Never panics: a ticket released by a non-owning thread is a caller bug
    /// and is logged and dropped rather than corrupting the lock state.
    pub fn release(&self, ticket: LockTicket) {
        let me = thread::current().id();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        if inner.owner != Some(me) {
            warn!(
                "ticket for {} released by a thread that does not own the lock; ignoring",
                ticket.active_context
            );
            return;
        }

        inner.current = ticket.saved_context;
        inner.depth = inner.depth.saturating_sub(1);
        if inner.depth == 0 {
            inner.owner = None;
            debug!("released lock, restored context {:?}", inner.current);
            drop(inner);
            self.available.notify_all();
        } else {
            debug!(
                "reentrant release of {} (depth {})",
                ticket.active_context, inner.depth
            );
        }
    }

    /// Token of the call chain currently executing inside the lock, if any.
    ///
    /// Readable from any thread; this is what the interrupt controller
    /// targets.
    pub fn current_context(&self) -> Option<ContextToken> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .current
    }

    /// Whether any thread currently holds the lock.
    pub fn is_held(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .owner
            .is_some()
    }

    /// Whether the calling thread holds the lock.
    pub fn held_by_current_thread(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .owner
            == Some(thread::current().id())
    }

    pub fn stats(&self) -> LockStats {
        LockStats {
            held: self.is_held(),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            contentions: self.contentions.load(Ordering::Relaxed),
        }
    }
}

impl Default for ExecLock {
    fn default() -> Self {
        Self::new()
    }
}
