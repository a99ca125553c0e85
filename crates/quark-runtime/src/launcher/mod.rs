//! Sandbox process launcher.
//!
//! Spawns `quark-sandbox-host` with one end of a Unix socket pair as its
//! stdin, exchanges pipe descriptors over that socket, and then watches it:
//! the peer never writes to it again, so EOF means the peer died.
//!
//! Binding is expensive enough to be worth doing early; [`ProcessLauncher::pre_start`]
//! runs it on a background thread and [`ProcessLauncher::ensure_bind`] joins
//! that work (or binds synchronously if it never started).

mod handshake;
mod watch;

use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use filedescriptor::FileDescriptor;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::channel::{ChannelDescriptors, FailureHandle};
use crate::config::{LauncherConfig, QuarkConfig, SANDBOX_SETTINGS_FLAG, SandboxSettings};
use crate::error::LaunchError;

pub use handshake::{HandshakeResult, app_handshake, peer_handshake};
pub use watch::{DeathAction, DeathWatch, exit_process};

/// Name of the peer binary.
pub const SANDBOX_HOST_BINARY: &str = "quark-sandbox-host";

// ─────────────────────────────────────────────────────────────────────────────
// App side
// ─────────────────────────────────────────────────────────────────────────────

struct Bound {
    child: Arc<Mutex<Child>>,
    pid: u32,
    channels: Option<HandshakeResult>,
    watch: DeathWatch,
}

enum LaunchState {
    Idle,
    Starting(JoinHandle<Result<Bound, LaunchError>>),
    Bound(Bound),
    /// Keeps the released child so [`ProcessLauncher::wait_for_exit`] can
    /// still reap it.
    Stopped(Option<Arc<Mutex<Child>>>),
}

/// Owns the sandbox child process and the descriptors connecting to it.
pub struct ProcessLauncher {
    config: LauncherConfig,
    /// Settings flag followed by `extra_args`.
    peer_args: Vec<String>,
    on_death: DeathAction,
    state: Mutex<LaunchState>,
}

impl ProcessLauncher {
    /// Launcher that exits the current process if the sandbox dies.
    pub fn new(config: &QuarkConfig) -> Result<Arc<Self>, LaunchError> {
        Self::with_death_action(config, exit_process())
    }

    /// The sandbox is started with the engine, channel and logging
    /// sections of `config`.
    pub fn with_death_action(
        config: &QuarkConfig,
        on_death: DeathAction,
    ) -> Result<Arc<Self>, LaunchError> {
        let settings = SandboxSettings::from_config(config).encode()?;
        let mut peer_args = vec![SANDBOX_SETTINGS_FLAG.to_string(), settings];
        peer_args.extend(config.launcher.extra_args.iter().cloned());

        let launcher = Arc::new(Self {
            config: config.launcher.clone(),
            peer_args,
            on_death,
            state: Mutex::new(LaunchState::Idle),
        });
        if launcher.config.prestart {
            launcher.pre_start();
        }
        Ok(launcher)
    }

    /// Command-line arguments the sandbox host is started with.
    pub fn peer_args(&self) -> &[String] {
        &self.peer_args
    }

    /// Start binding in the background. No-op unless idle.
    pub fn pre_start(&self) {
        let mut state = self.state.lock();
        if !matches!(*state, LaunchState::Idle) {
            return;
        }
        let binary = self.host_binary_path();
        let args = self.peer_args.clone();
        let on_death = self.on_death.clone();
        match thread::Builder::new()
            .name("quark-prestart".into())
            .spawn(move || bind(binary, &args, on_death))
        {
            Ok(handle) => {
                debug!("[ProcessLauncher::pre_start] binding in background");
                *state = LaunchState::Starting(handle);
            }
            Err(err) => warn!("[ProcessLauncher::pre_start] cannot spawn thread: {}", err),
        }
    }

    /// Make sure a sandbox is running and connected. Joins a background
    /// bind or binds synchronously. A sandbox that died is replaced.
    pub fn ensure_bind(&self) -> Result<(), LaunchError> {
        let mut state = self.state.lock();
        loop {
            match std::mem::replace(&mut *state, LaunchState::Idle) {
                LaunchState::Bound(bound) if !bound.watch.is_dead() => {
                    *state = LaunchState::Bound(bound);
                    return Ok(());
                }
                LaunchState::Bound(_) => {
                    info!("[ProcessLauncher::ensure_bind] previous sandbox is gone, rebinding");
                }
                LaunchState::Starting(handle) => {
                    let bound = handle.join().map_err(|_| {
                        LaunchError::Handshake("pre-start thread panicked".into())
                    })??;
                    *state = LaunchState::Bound(bound);
                }
                LaunchState::Idle => {
                    let bound = bind(
                        self.host_binary_path(),
                        &self.peer_args,
                        self.on_death.clone(),
                    )?;
                    *state = LaunchState::Bound(bound);
                    return Ok(());
                }
                LaunchState::Stopped(child) => {
                    *state = LaunchState::Stopped(child);
                    return Err(LaunchError::Stopped);
                }
            }
        }
    }

    /// Hand out `(positive, passive)`: the channel the app calls on and the
    /// one it serves. Binds first if needed; a second call fails until the
    /// sandbox is replaced.
    pub fn take_channel_descriptors(
        &self,
    ) -> Result<(ChannelDescriptors, ChannelDescriptors), LaunchError> {
        self.ensure_bind()?;
        let mut state = self.state.lock();
        match &mut *state {
            LaunchState::Bound(bound) => {
                let channels = bound.channels.take().ok_or(LaunchError::DescriptorsTaken)?;
                Ok((channels.positive, channels.passive))
            }
            _ => Err(LaunchError::Stopped),
        }
    }

    /// Fail the outstanding calls behind `handle` if the sandbox dies.
    pub fn watch_channel(&self, handle: FailureHandle) {
        match &*self.state.lock() {
            LaunchState::Bound(bound) => bound.watch.register(handle),
            _ => debug!("[ProcessLauncher::watch_channel] no sandbox bound"),
        }
    }

    /// A channel to the sandbox broke. Handled like the sandbox dying,
    /// once, unless the launcher was stopped first.
    pub fn report_channel_fault(&self, reason: &str) {
        match &*self.state.lock() {
            LaunchState::Bound(bound) => bound.watch.report_fault(reason),
            _ => debug!("[ProcessLauncher::report_channel_fault] ignored: {}", reason),
        }
    }

    /// Orderly stop: the sandbox exiting from here on is expected. The child
    /// is reaped by the death watch once it closes its end.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        let child = match std::mem::replace(&mut *state, LaunchState::Stopped(None)) {
            LaunchState::Bound(bound) => {
                bound.watch.disarm();
                info!("[ProcessLauncher::stop] sandbox {} released", bound.pid);
                Some(bound.child)
            }
            LaunchState::Starting(handle) => {
                if let Ok(Ok(bound)) = handle.join() {
                    bound.watch.disarm();
                    kill(&bound.child);
                }
                None
            }
            LaunchState::Stopped(child) => child,
            LaunchState::Idle => None,
        };
        *state = LaunchState::Stopped(child);
    }

    pub fn pid(&self) -> Option<u32> {
        match &*self.state.lock() {
            LaunchState::Bound(bound) => Some(bound.pid),
            _ => None,
        }
    }

    /// Whether a sandbox is bound, armed, and alive.
    pub fn is_connected(&self) -> bool {
        match &*self.state.lock() {
            LaunchState::Bound(bound) => bound.watch.is_armed() && !bound.watch.is_dead(),
            _ => false,
        }
    }

    /// Wait up to `timeout` for the sandbox to exit, killing it afterwards.
    pub fn wait_for_exit(&self, timeout: Duration) -> Result<Option<ExitStatus>, LaunchError> {
        let child = match &*self.state.lock() {
            LaunchState::Bound(bound) => bound.child.clone(),
            LaunchState::Stopped(Some(child)) => child.clone(),
            _ => return Ok(None),
        };

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = child.lock().try_wait()? {
                return Ok(Some(status));
            }
            if Instant::now() >= deadline {
                warn!("[ProcessLauncher::wait_for_exit] sandbox still running, killing it");
                kill(&child);
                return Ok(child.lock().try_wait()?);
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn host_binary_path(&self) -> PathBuf {
        self.config.host_binary.clone().unwrap_or_else(|| {
            // Next to the current executable first
            if let Some(dir) = std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(|dir| dir.to_path_buf()))
            {
                let host_path = dir.join(SANDBOX_HOST_BINARY);
                if host_path.exists() {
                    return host_path;
                }
            }
            // Fall back to PATH
            PathBuf::from(SANDBOX_HOST_BINARY)
        })
    }
}

impl Drop for ProcessLauncher {
    fn drop(&mut self) {
        if let LaunchState::Bound(bound) = &*self.state.lock() {
            bound.watch.disarm();
        }
    }
}

fn kill(child: &Mutex<Child>) {
    let mut child = child.lock();
    if let Err(err) = child.kill() {
        debug!("[ProcessLauncher] kill failed: {}", err);
    }
    let _ = child.wait();
}

fn bind(binary: PathBuf, args: &[String], on_death: DeathAction) -> Result<Bound, LaunchError> {
    let (control, peer_control) = filedescriptor::socketpair()?;

    info!("Spawning sandbox process: {}", binary.display());
    let child = Command::new(&binary)
        .args(args)
        .stdin(peer_control.as_stdio()?)
        .stdout(Stdio::null())
        .stderr(Stdio::inherit()) // Sandbox logs go to our stderr
        .spawn()
        .map_err(LaunchError::Spawn)?;
    drop(peer_control);

    let pid = child.id();
    let child = Arc::new(Mutex::new(child));

    let channels = match app_handshake(&control) {
        Ok(channels) => channels,
        Err(err) => {
            kill(&child);
            return Err(err);
        }
    };

    let watch = DeathWatch::spawn("sandbox", control, on_death, Some(child.clone()))?;
    info!("[ProcessLauncher] sandbox {} bound", pid);

    Ok(Bound {
        child,
        pid,
        channels: Some(channels),
        watch,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Peer side
// ─────────────────────────────────────────────────────────────────────────────

/// Channels held by the sandbox process, plus the watch on its app.
pub struct PeerBinding {
    /// Engine operations arrive here.
    pub passive: ChannelDescriptors,
    /// Host callbacks go out here.
    pub positive: ChannelDescriptors,
    pub watch: DeathWatch,
}

/// Complete the handshake over the control socket on stdin and start
/// watching it. The process exits through `on_death` if the app goes away.
pub fn accept_handshake(on_death: DeathAction) -> Result<PeerBinding, LaunchError> {
    let control = FileDescriptor::dup(&std::io::stdin())?;
    let channels = peer_handshake(&control)?;
    let watch = DeathWatch::spawn("app", control, on_death, None)?;
    Ok(PeerBinding {
        passive: channels.passive,
        positive: channels.positive,
        watch,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting() -> (DeathAction, Arc<AtomicUsize>) {
        let deaths = Arc::new(AtomicUsize::new(0));
        let counter = deaths.clone();
        let action: DeathAction = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (action, deaths)
    }

    fn launcher_for(binary: &str) -> (Arc<ProcessLauncher>, Arc<AtomicUsize>) {
        let (action, deaths) = counting();
        let mut config = QuarkConfig::default();
        config.launcher.host_binary = Some(PathBuf::from(binary));
        (ProcessLauncher::with_death_action(&config, action).unwrap(), deaths)
    }

    #[test]
    fn test_peer_args_carry_settings_before_extra_args() {
        let mut config = QuarkConfig::default();
        config.engine.memory_limit_mb = 12;
        config.launcher.extra_args = vec!["--verbose".into()];
        let launcher = ProcessLauncher::with_death_action(&config, counting().0).unwrap();

        let args = launcher.peer_args();
        assert_eq!(args.len(), 3);
        assert_eq!(args[0], SANDBOX_SETTINGS_FLAG);
        let settings = SandboxSettings::decode(&args[1]).unwrap();
        assert_eq!(settings.engine.memory_limit_mb, 12);
        assert_eq!(args[2], "--verbose");
    }

    #[test]
    fn test_channel_fault_without_sandbox_is_ignored() {
        let (launcher, deaths) = launcher_for("true");
        launcher.report_channel_fault("engine channel broke");
        assert_eq!(deaths.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_missing_binary_fails_to_spawn() {
        let (launcher, _) = launcher_for("/nonexistent/quark-sandbox-host");
        assert!(matches!(launcher.ensure_bind(), Err(LaunchError::Spawn(_))));
        assert!(!launcher.is_connected());
    }

    #[test]
    fn test_peer_without_handshake_fails_bind() {
        // `true` exits at once and never answers.
        let (launcher, deaths) = launcher_for("true");
        assert!(matches!(
            launcher.take_channel_descriptors(),
            Err(LaunchError::Handshake(_))
        ));
        assert_eq!(deaths.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stopped_launcher_refuses_to_bind() {
        let (launcher, _) = launcher_for("true");
        launcher.stop();
        assert!(matches!(launcher.ensure_bind(), Err(LaunchError::Stopped)));
        assert_eq!(launcher.pid(), None);
    }
}
