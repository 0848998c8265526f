/// One-shot runtime initialization and search-path configuration.
///
/// Initialization is guarded by a per-instance `Once`, not by the execution
/// lock; the lock itself assumes an initialized runtime, so guarding this
/// with it would invert the dependency. The sequence must also tolerate an
/// engine that was already initialized by an embedder entirely outside this
/// crate: in that case the fresh-init call is skipped (detected through the
/// threading-support probe) and only the ensure-style path configuration
/// runs. Re-running the engine init in that situation would deadlock callers
/// that re-enter expecting the lock to already be held.
///
/// Failure is not modeled: if this cannot complete, the process is unusable.
use crate::config::GateConfig;
use crate::observability::{self, GateEventKind};
use crate::runtime::engine::ScriptRuntime;
use log::{debug, info};
use std::path::Path;

/// Idempotent, thread-safe initialization of one runtime instance.
///
/// Safe to call from any thread, any number of times; the real work happens
/// exactly once. Later calls with a different config are no-ops; the first
/// caller's configuration wins.
pub fn ensure_initialized(runtime: &ScriptRuntime, config: &GateConfig) {
    runtime.bootstrap_once().call_once(|| {
        if runtime.threads_active() {
            // Initialized by an external embedder; take the ensure path and
            // leave the engine's own state untouched.
            debug!("runtime already initialized externally, configuring paths only");
        } else {
            runtime.run_engine_init();
        }

        // Search order after this block: host module dir first, then the
        // platform runtime home, then any extras, with the current directory
        // searched last.
        runtime.append_search_path(Path::new("."));
        for extra in config.extra_search_paths.iter().rev() {
            runtime.prepend_search_path(extra);
        }
        runtime.prepend_search_path(&config.runtime_home);
        runtime.prepend_search_path(&config.host_module_dir);

        runtime.run_bootstrap_sequence();

        observability::emit(GateEventKind::BootstrapCompleted, None, None);
        info!(
            "runtime bootstrap complete ({} search paths)",
            runtime.search_paths().len()
        );
    });
}
