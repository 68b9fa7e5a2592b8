//! Registry of running encoder processes.
//!
//! Every child process is registered while its job is running so a stop
//! request can reach it from another task. The registry never owns the child
//! itself: the encoder that spawned it keeps waiting on it, and the registry
//! only holds a handle that can signal the process and ask the encoder to
//! force-kill it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How often `terminate_all` checks whether signalled processes have exited.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// A live child process as seen by the registry.
#[derive(Debug)]
pub struct ProcessHandle {
    id: u64,
    pid: Option<u32>,
    label: String,
    kill_requested: AtomicBool,
    kill: Notify,
}

impl ProcessHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// OS process id, if the child was still alive when it was registered.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Ask the owner of the child to kill it outright.
    pub fn request_kill(&self) {
        self.kill_requested.store(true, Ordering::SeqCst);
        self.kill.notify_one();
    }

    pub fn kill_was_requested(&self) -> bool {
        self.kill_requested.load(Ordering::SeqCst)
    }

    /// Resolves once [`ProcessHandle::request_kill`] has been called.
    pub async fn killed(&self) {
        if self.kill_was_requested() {
            return;
        }
        self.kill.notified().await;
    }

    /// Send the graceful termination signal.
    ///
    /// Returns false when no signal could be delivered, in which case the
    /// caller should go straight to [`ProcessHandle::request_kill`].
    pub fn terminate(&self) -> bool {
        match self.pid {
            Some(pid) => send_terminate(pid),
            None => false,
        }
    }
}

#[cfg(unix)]
fn send_terminate(pid: u32) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        Ok(()) => true,
        Err(e) => {
            debug!(pid, error = %e, "SIGTERM not delivered");
            false
        }
    }
}

#[cfg(not(unix))]
fn send_terminate(_pid: u32) -> bool {
    false
}

/// Outcome of [`ProcessRegistry::terminate_all`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TerminationSummary {
    /// Processes that received the graceful signal.
    pub signalled: usize,
    /// Processes still registered after the grace period, or that could not be signalled.
    pub force_killed: usize,
}

/// Thread-safe set of running encoder processes.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    handles: Mutex<HashMap<u64, Arc<ProcessHandle>>>,
    next_id: AtomicU64,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Arc<ProcessHandle>>> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.handles.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create a handle for a freshly spawned child without registering it.
    pub fn new_handle(&self, pid: Option<u32>, label: impl Into<String>) -> Arc<ProcessHandle> {
        Arc::new(ProcessHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            pid,
            label: label.into(),
            kill_requested: AtomicBool::new(false),
            kill: Notify::new(),
        })
    }

    pub fn register(&self, handle: Arc<ProcessHandle>) {
        debug!(id = handle.id, pid = ?handle.pid, label = %handle.label, "registering process");
        self.lock().insert(handle.id, handle);
    }

    /// Remove a handle; returns whether it was still registered.
    pub fn unregister(&self, id: u64) -> bool {
        let removed = self.lock().remove(&id).is_some();
        if removed {
            debug!(id, "unregistered process");
        }
        removed
    }

    /// Register a child and get a guard that unregisters it when dropped.
    pub fn track(
        self: &Arc<Self>,
        pid: Option<u32>,
        label: impl Into<String>,
    ) -> Registration {
        let handle = self.new_handle(pid, label);
        self.register(handle.clone());
        Registration {
            registry: Arc::clone(self),
            handle,
        }
    }

    pub fn contains(&self, id: u64) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of the currently registered handles.
    pub fn snapshot(&self) -> Vec<Arc<ProcessHandle>> {
        self.lock().values().cloned().collect()
    }

    /// Terminate every registered process.
    ///
    /// Works on a snapshot: each process gets the graceful signal, the
    /// registry is watched for up to `grace` for them to exit (the owning
    /// encoder unregisters on exit), survivors are force-killed, and the
    /// registry is cleared.
    pub async fn terminate_all(&self, grace: Duration) -> TerminationSummary {
        let targets = self.snapshot();
        let mut summary = TerminationSummary::default();
        if targets.is_empty() {
            return summary;
        }

        let mut pending = Vec::with_capacity(targets.len());
        for handle in targets {
            if handle.terminate() {
                summary.signalled += 1;
                pending.push(handle);
            } else {
                handle.request_kill();
                summary.force_killed += 1;
            }
        }

        let deadline = Instant::now() + grace;
        loop {
            pending.retain(|handle| self.contains(handle.id));
            if pending.is_empty() || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(EXIT_POLL_INTERVAL).await;
        }

        for handle in &pending {
            warn!(
                pid = ?handle.pid,
                label = %handle.label,
                "process still running after {:?}, killing",
                grace
            );
            handle.request_kill();
        }
        summary.force_killed += pending.len();

        self.lock().clear();
        summary
    }
}

/// Registration of one child process; unregisters on drop.
///
/// Dropping happens on every exit path of the encoder, including early
/// returns and panics, so a finished job never leaves its handle behind.
#[derive(Debug)]
pub struct Registration {
    registry: Arc<ProcessRegistry>,
    handle: Arc<ProcessHandle>,
}

impl Registration {
    pub fn handle(&self) -> &Arc<ProcessHandle> {
        &self.handle
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(self.handle.id);
    }
}
