//! Message loop: one dedicated thread and an ordered mailbox per engine.
//!
//! Every engine operation is a message processed on the loop thread, one at
//! a time and in arrival order. The engine itself is created on that thread
//! by a factory and never leaves it.

mod context;
mod worker;

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::engine::{Engine, EngineControl};
use crate::error::{EngineError, LoopError};
use crate::host::HostCallbacks;
use crate::lifecycle::{AppState, AppStateCell};
use crate::message::EngineCall;
use crate::waiter::{Resolver, sync_waiter};

pub use context::LoopContext;

/// Builds the engine and host on the loop thread.
pub type EngineFactory =
    Box<dyn FnOnce() -> Result<(Box<dyn Engine>, Arc<dyn HostCallbacks>), EngineError> + Send>;

type Task = Box<dyn FnOnce(&LoopContext) + Send>;

/// An entry in the loop's mailbox.
pub(crate) enum Message {
    Engine {
        call: EngineCall,
        reply: Option<Resolver<Value>>,
    },
    Task(Task),
    Block {
        epoch: u64,
    },
    Shutdown,
}

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

/// State shared between handles and the loop thread.
pub(crate) struct LoopShared {
    pub(crate) id: u64,
    pub(crate) name: String,
    pub(crate) state: AppStateCell,
    pub(crate) expected_termination: AtomicBool,
    block_epoch: AtomicU64,
    released: watch::Sender<u64>,
    shutdown_requested: AtomicBool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Handle
// ─────────────────────────────────────────────────────────────────────────────

/// Cloneable handle to a running message loop.
#[derive(Clone)]
pub struct MessageLoop {
    inner: Arc<LoopInner>,
}

struct LoopInner {
    shared: Arc<LoopShared>,
    mailbox: mpsc::UnboundedSender<Message>,
    timers: tokio::runtime::Handle,
    control: Arc<dyn EngineControl>,
    thread_id: ThreadId,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl MessageLoop {
    /// Start a loop thread named `name`. `factory` runs first on that thread;
    /// if it fails the loop never accepts a message.
    pub fn spawn<F>(name: impl Into<String>, factory: F) -> Result<Self, LoopError>
    where
        F: FnOnce() -> Result<(Box<dyn Engine>, Arc<dyn HostCallbacks>), EngineError>
            + Send
            + 'static,
    {
        spawn_loop(name.into(), Box::new(factory))
    }

    pub fn name(&self) -> &str {
        &self.inner.shared.name
    }

    pub fn app_state(&self) -> AppState {
        self.inner.shared.state.get()
    }

    pub(crate) fn state_cell(&self) -> &AppStateCell {
        &self.inner.shared.state
    }

    /// Whether the calling thread is this loop's thread.
    pub fn is_loop_thread(&self) -> bool {
        thread::current().id() == self.inner.thread_id
    }

    /// Queue an engine operation. Application-scoped operations are refused
    /// once shutdown has begun.
    pub fn post(&self, call: EngineCall) {
        if !self.admits(&call) {
            return;
        }
        self.post_unchecked(call);
    }

    /// Queue an engine operation after `delay`.
    pub fn post_delayed(&self, call: EngineCall, delay: Duration) {
        if !self.admits(&call) {
            return;
        }
        self.send_after(Message::Engine { call, reply: None }, delay);
    }

    /// Queue without the admission check. Used for teardown.
    pub(crate) fn post_unchecked(&self, call: EngineCall) {
        self.send(Message::Engine { call, reply: None });
    }

    /// Run an engine operation and wait for its result. On the loop thread
    /// the operation runs immediately.
    pub fn call(&self, call: EngineCall) -> Result<Value, LoopError> {
        if !self.admits(&call) {
            return Ok(call.fallback());
        }
        if let Some(ctx) = context::current(self.inner.shared.id) {
            return ctx.process(&call);
        }
        let (resolver, waiter) = sync_waiter();
        if !self.send(Message::Engine {
            call,
            reply: Some(resolver),
        }) {
            return Err(LoopError::Stopped);
        }
        waiter.wait().map_err(|_| LoopError::Stopped)
    }

    /// Queue `task` to run on the loop thread without waiting for it.
    pub(crate) fn post_task(&self, task: impl FnOnce(&LoopContext) + Send + 'static) -> bool {
        self.send(Message::Task(Box::new(task)))
    }

    /// Run `f` on the loop thread and wait for its result. Runs inline when
    /// already on the loop thread. A panic in `f` is returned as an error
    /// and the loop keeps running.
    pub fn post_and_wait<R, F>(&self, f: F) -> Result<R, LoopError>
    where
        F: FnOnce(&LoopContext) -> R + Send + 'static,
        R: Send + 'static,
    {
        if let Some(ctx) = context::current(self.inner.shared.id) {
            return catch_unwind(AssertUnwindSafe(|| f(ctx.as_ref())))
                .map_err(|panic| LoopError::CallablePanicked(panic_message(panic)));
        }

        let (resolver, waiter) = sync_waiter();
        let task: Task = Box::new(move |ctx| {
            match catch_unwind(AssertUnwindSafe(|| f(ctx))) {
                Ok(value) => resolver.resolve(value),
                Err(panic) => resolver.fail(panic_message(panic)),
            };
        });
        if !self.send(Message::Task(task)) {
            return Err(LoopError::Stopped);
        }
        waiter.wait().map_err(LoopError::from)
    }

    /// Halt the loop thread after `delay`. Messages keep queueing until
    /// [`unblock`](Self::unblock).
    pub fn block(&self, delay: Duration) {
        let epoch = self.inner.shared.block_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("[{}] block {} in {:?}", self.name(), epoch, delay);
        self.send_after(Message::Block { epoch }, delay);
    }

    /// Release the loop, cancelling any block that has not fired yet. Acts
    /// from the calling thread.
    pub fn unblock(&self) {
        let epoch = self.inner.shared.block_epoch.load(Ordering::SeqCst);
        self.inner.shared.released.send_replace(epoch);
        self.inner.control.unblock();
    }

    pub fn is_blocked(&self) -> bool {
        self.inner.shared.block_epoch.load(Ordering::SeqCst) > *self.inner.shared.released.borrow()
    }

    /// Interrupt the running script. The resulting script error is
    /// swallowed once.
    pub fn terminate_execution(&self) {
        let shared = &self.inner.shared;
        shared.expected_termination.store(true, Ordering::SeqCst);
        if self.inner.control.terminate_execution() {
            info!("[{}] terminating script execution", self.name());
        } else {
            shared.expected_termination.store(false, Ordering::SeqCst);
            debug!("[{}] no local script to interrupt", self.name());
        }
    }

    /// Dispose the engine and stop the loop after `delay`. Only the first
    /// call has an effect.
    pub fn shutdown(&self, delay: Duration) {
        if self.inner.shared.shutdown_requested.swap(true, Ordering::SeqCst) {
            debug!("[{}] shutdown already requested", self.name());
            return;
        }
        self.unblock();
        self.send_after(Message::Shutdown, delay);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.inner.shared.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Wait for the loop thread to exit. Returns immediately on the loop
    /// thread itself.
    pub fn join(&self) -> Result<(), LoopError> {
        if self.is_loop_thread() {
            return Ok(());
        }
        let handle = self.inner.thread.lock().take();
        if let Some(handle) = handle {
            handle.join().map_err(|_| LoopError::ThreadPanic)?;
        }
        Ok(())
    }

    pub(crate) fn admits(&self, call: &EngineCall) -> bool {
        let state = self.app_state();
        if call.is_app_scoped() && state.refuses_admission() {
            debug!("[{}] refusing {:?}: app state {:?}", self.name(), call.opcode(), state);
            return false;
        }
        true
    }

    fn send(&self, message: Message) -> bool {
        if self.inner.mailbox.send(message).is_err() {
            debug!("[{}] mailbox closed", self.name());
            return false;
        }
        true
    }

    fn send_after(&self, message: Message, delay: Duration) {
        if delay.is_zero() {
            self.send(message);
            return;
        }
        let mailbox = self.inner.mailbox.clone();
        self.inner.timers.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = mailbox.send(message);
        });
    }
}

impl Drop for LoopInner {
    fn drop(&mut self) {
        if !self.shared.shutdown_requested.swap(true, Ordering::SeqCst) {
            self.shared
                .released
                .send_replace(self.shared.block_epoch.load(Ordering::SeqCst));
            let _ = self.mailbox.send(Message::Shutdown);
        }
        if thread::current().id() == self.thread_id {
            return;
        }
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Spawn
// ─────────────────────────────────────────────────────────────────────────────

struct LoopReady {
    timers: tokio::runtime::Handle,
    control: Arc<dyn EngineControl>,
}

fn spawn_loop(name: String, factory: EngineFactory) -> Result<MessageLoop, LoopError> {
    debug!("[spawn_loop] starting {}", name);

    let (released, released_rx) = watch::channel(0u64);
    let shared = Arc::new(LoopShared {
        id: NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed),
        name: name.clone(),
        state: AppStateCell::default(),
        expected_termination: AtomicBool::new(false),
        block_epoch: AtomicU64::new(0),
        released,
        shutdown_requested: AtomicBool::new(false),
    });

    let (mailbox, mailbox_rx) = mpsc::unbounded_channel();
    let (init_tx, init_rx) = std::sync::mpsc::sync_channel::<Result<LoopReady, String>>(1);

    let thread_shared = shared.clone();
    let thread = thread::Builder::new()
        .name(format!("quark-loop-{}", name))
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(err) => {
                    let _ = init_tx.send(Err(format!("failed to build loop runtime: {}", err)));
                    return;
                }
            };

            let parts = match catch_unwind(AssertUnwindSafe(factory)) {
                Ok(Ok(parts)) => parts,
                Ok(Err(err)) => {
                    let _ = init_tx.send(Err(err.to_string()));
                    return;
                }
                Err(panic) => {
                    let _ = init_tx.send(Err(panic_message(panic)));
                    return;
                }
            };
            let (engine, host) = parts;

            let ctx = Rc::new(LoopContext::new(thread_shared.clone(), engine, host));
            context::install(ctx.clone());
            thread_shared.state.set(AppState::RuntimeInited);

            let ready = LoopReady {
                timers: rt.handle().clone(),
                control: ctx.control(),
            };
            if init_tx.send(Ok(ready)).is_err() {
                context::uninstall();
                return;
            }

            rt.block_on(worker::run_loop(ctx, mailbox_rx, released_rx));
            context::uninstall();
            rt.shutdown_background();
            debug!("[spawn_loop:{}] thread exiting", thread_shared.name);
        })?;

    let thread_id = thread.thread().id();
    let ready = match init_rx.recv() {
        Ok(Ok(ready)) => ready,
        Ok(Err(reason)) => {
            let _ = thread.join();
            warn!("[spawn_loop] {} failed to initialize: {}", name, reason);
            return Err(LoopError::Init(reason));
        }
        Err(_) => {
            let _ = thread.join();
            return Err(LoopError::Init("loop thread exited during init".into()));
        }
    };

    info!("[spawn_loop] {} is ready", name);
    Ok(MessageLoop {
        inner: Arc::new(LoopInner {
            shared,
            mailbox,
            timers: ready.timers,
            control: ready.control,
            thread_id,
            thread: Mutex::new(Some(thread)),
        }),
    })
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests;
