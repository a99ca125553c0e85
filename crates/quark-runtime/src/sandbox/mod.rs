//! Sandboxed backend.
//!
//! The app process keeps a [`RemoteEngine`] on its message loop; the
//! sandbox process runs the real engine on its own loop and reaches the
//! app's host through a [`RemoteHost`]. Each side holds one channel it
//! calls on (positive) and one it serves (passive).

mod dispatch;
mod remote;

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::channel::{ChannelDescriptors, ChannelReceiver, ChannelSender};
use crate::config::{ChannelConfig, EngineConfig};
use crate::error::{ChannelError, LoopError};
use crate::host::HostCallbacks;
use crate::inprocess::QuickJsEngine;
use crate::message_loop::MessageLoop;

pub use dispatch::{HostDispatcher, SandboxDispatcher};
pub use remote::{RemoteControl, RemoteEngine, RemoteHost, ShutdownHook};

/// Wire the app side: engine calls go out on `positive`, host callbacks
/// are served from `passive` against `host`.
pub fn connect_app(
    positive: ChannelDescriptors,
    passive: ChannelDescriptors,
    host: Arc<dyn HostCallbacks>,
    channel: &ChannelConfig,
) -> Result<RemoteEngine, ChannelError> {
    let (read, write) = positive.into_streams();
    let sender = ChannelSender::spawn("app-engine", read, write, channel.call_timeout())?;

    let (read, write) = passive.into_streams();
    let receiver = ChannelReceiver::spawn(
        "app-host",
        read,
        write,
        Arc::new(HostDispatcher::new(host)),
    )?;

    debug!("[connect_app] sandbox channels wired");
    Ok(RemoteEngine::new(sender, receiver))
}

/// Errors while bringing up the sandbox side.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Loop(#[from] LoopError),
}

/// The engine side of a sandbox: a message loop running QuickJS, fed by
/// the app's engine calls.
pub struct SandboxRuntime {
    message_loop: MessageLoop,
    host_sender: Arc<ChannelSender>,
    engine_receiver: ChannelReceiver,
}

impl SandboxRuntime {
    /// Start serving. Engine calls arrive on `passive`; host callbacks go
    /// out on `positive`.
    pub fn serve(
        passive: ChannelDescriptors,
        positive: ChannelDescriptors,
        engine: EngineConfig,
        channel: &ChannelConfig,
    ) -> Result<Self, ServeError> {
        let (read, write) = positive.into_streams();
        let host_sender = ChannelSender::spawn("sandbox-host", read, write, channel.call_timeout())?;
        let host: Arc<dyn HostCallbacks> = Arc::new(RemoteHost::new(host_sender.clone()));

        let message_loop = MessageLoop::spawn("sandbox", QuickJsEngine::factory(engine, host))?;

        let on_lost = message_loop.clone();
        host_sender.on_disconnect(move |reason| {
            info!("[SandboxRuntime] app unreachable ({}), shutting down", reason);
            on_lost.shutdown(Duration::ZERO);
        });

        let (read, write) = passive.into_streams();
        let engine_receiver = ChannelReceiver::spawn(
            "sandbox-engine",
            read,
            write,
            Arc::new(SandboxDispatcher::new(message_loop.clone())),
        )?;

        info!("[SandboxRuntime::serve] ready");
        Ok(Self {
            message_loop,
            host_sender,
            engine_receiver,
        })
    }

    pub fn message_loop(&self) -> &MessageLoop {
        &self.message_loop
    }

    /// Block until the loop stops, then close both channels.
    pub fn wait(self) -> Result<(), LoopError> {
        let result = self.message_loop.join();
        self.engine_receiver.close();
        self.host_sender.close();
        debug!("[SandboxRuntime::wait] stopped");
        result
    }
}

#[cfg(test)]
mod tests;
