use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::config::GateConfig;
use crate::guard::{GuardFlags, RuntimeGuard};
use crate::interrupt::InterruptController;
use crate::lock::ExecLock;
use crate::runtime::bootstrap;
use crate::runtime::engine::ScriptRuntime;
use crate::session::SessionManager;
use crate::types::{GateError, GateStatus, HostIo, OutputHandle, SessionStreams};

#[derive(Parser)]
#[command(author, version, about = "Access gate for an embedded scripting runtime")]
struct Cli {
    /// Path to a scriptgate.json config file
    #[arg(long)]
    config: Option<std::path::PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an end-to-end check of lock, session and interrupt plumbing
    Selfcheck,
    /// Bootstrap a runtime and print a status snapshot
    Status,
}

pub fn run() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => GateConfig::load_from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => GateConfig::load_default().unwrap_or_default(),
    };

    match cli.command {
        Commands::Selfcheck => selfcheck(&config),
        Commands::Status => status(&config),
    }
}

fn status(config: &GateConfig) -> Result<()> {
    let runtime = ScriptRuntime::new();
    let lock = ExecLock::new();
    bootstrap::ensure_initialized(&runtime, config);

    let snapshot = GateStatus::collect(&runtime, &lock, None);
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

/// Drives one full round trip through every component: bootstrap, guarded
/// session entry with a redirected output stream, an interrupt observed at a
/// checkpoint, and teardown.
fn selfcheck(config: &GateConfig) -> Result<()> {
    let runtime = Arc::new(ScriptRuntime::new());
    let lock = Arc::new(ExecLock::new());
    bootstrap::ensure_initialized(&runtime, config);

    let session = SessionManager::new("selfcheck", HostIo::process());

    // Redirected-output round trip.
    let captured = Arc::new(Mutex::new(Vec::<u8>::new()));
    let handle: OutputHandle = captured.clone();
    {
        let guard = RuntimeGuard::with_session(
            &runtime,
            &lock,
            &session,
            GuardFlags::session_no_stdin(),
            SessionStreams {
                stdout: Some(handle),
                ..Default::default()
            },
        );
        if !guard.owns_session() {
            bail!("selfcheck guard failed to enter its session");
        }
        guard.write_stdout(b"ready\n")?;
    }
    if captured.lock().unwrap().as_slice() != b"ready\n" {
        bail!("redirected output did not reach the supplied handle");
    }
    if session.is_active() {
        bail!("session still active after guard teardown");
    }

    // Interrupt round trip: a second thread cancels the loop below.
    let controller = InterruptController::new(Arc::clone(&runtime), Arc::clone(&lock));
    let guard = RuntimeGuard::new(&runtime, &lock, GuardFlags::lock_only());
    let poster = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        controller.request_interrupt()
    });

    let mut interrupted = false;
    for _ in 0..1000 {
        match guard.checkpoint() {
            Err(GateError::Interrupted) => {
                interrupted = true;
                break;
            }
            Err(e) => return Err(e.into()),
            Ok(()) => thread::sleep(Duration::from_millis(5)),
        }
    }
    let posted = poster.join().expect("interrupt thread panicked");
    drop(guard);

    if !posted || !interrupted {
        bail!("interrupt was not delivered (posted={posted}, observed={interrupted})");
    }

    let snapshot = GateStatus::collect(&runtime, &lock, Some(&session));
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    println!("selfcheck passed");
    Ok(())
}
