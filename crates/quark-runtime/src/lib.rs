//! Quark runtime
//!
//! Hosts script-driven applications on a confined JavaScript engine.
//!
//! # Architecture
//!
//! - Each application owns a [`MessageLoop`]: one thread, one ordered mailbox,
//!   and the only place its engine is touched
//! - The engine is either QuickJS in this process ([`inprocess`]) or a proxy to
//!   a `quark-sandbox-host` process ([`sandbox`]) reached over two duplex pipe
//!   channels
//! - [`AppRuntime`] applies the application and page lifecycle on top
//! - The [`launcher`] spawns the sandbox, passes pipe descriptors over a Unix
//!   socket, and treats EOF on that socket as the peer's death

pub mod app;
pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod host;
pub mod inprocess;
#[cfg(unix)]
pub mod launcher;
pub mod lifecycle;
pub mod message;
pub mod message_loop;
pub mod sandbox;
pub mod types;
pub mod waiter;

pub use app::AppRuntime;
pub use config::{Backend, QuarkConfig};
pub use engine::{Engine, EngineControl, PageLaunch};
pub use error::{
    ChannelError, EngineError, EngineResult, LaunchError, LoopError, RuntimeError, ScriptError,
};
pub use host::HostCallbacks;
pub use lifecycle::{AppId, AppState, PageId, PageState};
pub use message_loop::MessageLoop;
