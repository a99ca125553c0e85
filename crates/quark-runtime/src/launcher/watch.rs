//! Peer-death detection on the control socket.

use std::io::Read;
use std::process::Child;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use filedescriptor::FileDescriptor;
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::channel::FailureHandle;
use crate::error::LaunchError;

/// What to do once the peer is gone. Receives a human-readable reason.
pub type DeathAction = Arc<dyn Fn(&str) + Send + Sync>;

/// Terminate the current process: the counterpart holds state this one
/// cannot recover.
pub fn exit_process() -> DeathAction {
    Arc::new(|reason| {
        error!("[DeathWatch] {}; exiting", reason);
        std::process::exit(1);
    })
}

struct WatchState {
    label: String,
    armed: AtomicBool,
    dead: AtomicBool,
    fired: AtomicBool,
    handles: Mutex<Vec<FailureHandle>>,
    action: DeathAction,
}

impl WatchState {
    /// Fail registered calls and run the action, at most once per watch.
    fn fire(&self, reason: &str) {
        self.dead.store(true, Ordering::SeqCst);
        if !self.armed.load(Ordering::SeqCst) {
            debug!("[DeathWatch] {} lost while disarmed: {}", self.label, reason);
            return;
        }
        if self.fired.swap(true, Ordering::SeqCst) {
            debug!("[DeathWatch] {} already reported, ignoring: {}", self.label, reason);
            return;
        }

        let handles = std::mem::take(&mut *self.handles.lock());
        let failed: usize = handles.iter().map(|h| h.fail_all(reason)).sum();
        info!("[DeathWatch] {} ({} outstanding calls failed)", reason, failed);
        (self.action)(reason);
    }
}

/// Blocks on the control socket in a background thread. The peer never
/// writes after the handshake, so the first read returning is its death.
#[derive(Clone)]
pub struct DeathWatch {
    state: Arc<WatchState>,
}

impl DeathWatch {
    /// Start watching `control`. `child` is reaped after the peer goes away.
    pub fn spawn(
        name: &str,
        mut control: FileDescriptor,
        action: DeathAction,
        child: Option<Arc<Mutex<Child>>>,
    ) -> Result<Self, LaunchError> {
        let state = Arc::new(WatchState {
            label: name.to_string(),
            armed: AtomicBool::new(true),
            dead: AtomicBool::new(false),
            fired: AtomicBool::new(false),
            handles: Mutex::new(Vec::new()),
            action,
        });

        let watched = state.clone();
        thread::Builder::new()
            .name(format!("quark-death-watch-{}", name))
            .spawn(move || {
                let label = &watched.label;
                let mut buf = [0u8; 64];
                let reason = loop {
                    match control.read(&mut buf) {
                        Ok(0) => break format!("{} closed its control socket", label),
                        Ok(_) => continue,
                        Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(err) => break format!("{} control socket failed: {}", label, err),
                    }
                };

                watched.dead.store(true, Ordering::SeqCst);
                if let Some(child) = child {
                    match child.lock().wait() {
                        Ok(status) => debug!("[DeathWatch] {} exited with {}", label, status),
                        Err(err) => debug!("[DeathWatch] could not reap {}: {}", label, err),
                    }
                }
                watched.fire(&reason);
            })?;

        Ok(Self { state })
    }

    /// Fail `handle`'s outstanding calls when the peer dies.
    pub fn register(&self, handle: FailureHandle) {
        if self.is_dead() && self.state.armed.load(Ordering::SeqCst) {
            handle.fail_all("peer process is gone");
            return;
        }
        self.state.handles.lock().push(handle);
    }

    /// Treat the peer as dead because a channel to it broke, even though
    /// the control socket is still open. Runs the action unless the watch
    /// is disarmed or has already fired.
    pub fn report_fault(&self, reason: &str) {
        self.state.fire(reason);
    }

    /// Stop reacting to the peer's death. Used for orderly shutdown.
    pub fn disarm(&self) {
        self.state.armed.store(false, Ordering::SeqCst);
        self.state.handles.lock().clear();
    }

    pub fn is_armed(&self) -> bool {
        self.state.armed.load(Ordering::SeqCst)
    }

    pub fn is_dead(&self) -> bool {
        self.state.dead.load(Ordering::SeqCst)
    }
}
