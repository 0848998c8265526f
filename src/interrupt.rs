/// Best-effort asynchronous cancellation of whatever is executing inside the
/// held lock.
///
/// The controller never blocks and never touches the execution lock itself:
/// it reads the currently recorded context token and posts a cancellation
/// signal into the runtime's mailbox. The signal is advisory: it becomes
/// observable at the next checkpoint the running flow polls, and a signal
/// that races the script's own completion is dropped with no observable
/// effect (context-token ids are never reused). No timeout mechanism lives
/// here; a caller wanting one races an external timer against
/// `request_interrupt`.
use crate::lock::ExecLock;
use crate::observability::{self, GateEventKind};
use crate::runtime::engine::ScriptRuntime;
use log::{debug, info};
use std::sync::Arc;

pub struct InterruptController {
    runtime: Arc<ScriptRuntime>,
    lock: Arc<ExecLock>,
}

impl InterruptController {
    pub fn new(runtime: Arc<ScriptRuntime>, lock: Arc<ExecLock>) -> Self {
        Self { runtime, lock }
    }

    /// Whether some call chain is currently inside the lock.
    pub fn is_executing(&self) -> bool {
        self.lock.current_context().is_some()
    }

    /// Request cancellation of the currently executing context.
    ///
    /// Returns false when nothing is executing (not an error), true once the
    /// signal has been posted, independent of whether it is ever observed.
    pub fn request_interrupt(&self) -> bool {
        match self.lock.current_context() {
            None => {
                debug!("interrupt requested but nothing is executing");
                false
            }
            Some(token) => {
                self.runtime.post_interrupt(token);
                let detail = token.to_string();
                observability::emit(GateEventKind::InterruptRequested, None, Some(detail.as_str()));
                info!("posted cancellation signal for {token}");
                true
            }
        }
    }
}
