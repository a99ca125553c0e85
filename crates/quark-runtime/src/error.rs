//! Error types for the runtime.

use serde::{Deserialize, Serialize};

use crate::waiter::WaitError;

/// A fault raised by script code while the engine was executing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct ScriptError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    /// Raised because execution was interrupted from outside.
    #[serde(default)]
    pub terminated: bool,
}

impl ScriptError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
            terminated: false,
        }
    }

    pub fn with_stack(mut self, stack: Option<String>) -> Self {
        self.stack = stack.filter(|s| !s.is_empty());
        self
    }

    pub fn interrupted(mut self) -> Self {
        self.terminated = true;
        self
    }
}

/// Errors returned by [`Engine`](crate::engine::Engine) operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("script error: {0}")]
    Script(#[from] ScriptError),

    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("engine unavailable: {0}")]
    Unavailable(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Errors from the message loop.
#[derive(Debug, thiserror::Error)]
pub enum LoopError {
    #[error("loop initialization failed: {0}")]
    Init(String),

    #[error("message loop has stopped")]
    Stopped,

    #[error("callable panicked: {0}")]
    CallablePanicked(String),

    #[error("engine is busy on this thread")]
    EngineBusy,

    #[error("message loop thread panicked")]
    ThreadPanic,

    #[error("failed to spawn loop thread: {0}")]
    SpawnFailed(#[from] std::io::Error),
}

impl From<WaitError> for LoopError {
    fn from(err: WaitError) -> Self {
        match err {
            WaitError::Failed(reason) => LoopError::CallablePanicked(reason),
            WaitError::Abandoned | WaitError::Timeout(_) => LoopError::Stopped,
        }
    }
}

/// Errors on the duplex channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel disconnected: {0}")]
    Disconnected(String),

    #[error("call timed out")]
    Timeout,

    #[error("remote error: {0}")]
    Remote(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<WaitError> for ChannelError {
    fn from(err: WaitError) -> Self {
        match err {
            WaitError::Failed(reason) => ChannelError::Disconnected(reason),
            WaitError::Abandoned => ChannelError::Disconnected("call abandoned".into()),
            WaitError::Timeout(_) => ChannelError::Timeout,
        }
    }
}

/// Errors from the process launcher.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to spawn sandbox process: {0}")]
    Spawn(std::io::Error),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("channel descriptors already taken")]
    DescriptorsTaken,

    #[error("launcher stopped")]
    Stopped,

    #[error(transparent)]
    Settings(#[from] crate::config::ConfigError),

    #[error("descriptor error: {0}")]
    Descriptor(#[from] filedescriptor::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors starting an [`AppRuntime`](crate::app::AppRuntime).
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Loop(#[from] LoopError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("sandboxed backend is not supported on this platform")]
    SandboxUnsupported,

    #[error("page {0} did not finish its first render")]
    PageNotReady(crate::lifecycle::PageId),
}
