//! State owned by the loop thread.
//!
//! `LoopContext` lives only on its loop thread. It owns the engine and is
//! reachable from the thread-local slot so that work issued on the loop
//! thread itself can run immediately instead of queueing behind itself.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use serde_json::Value;
use tracing::{debug, error, warn};

use crate::engine::{Engine, EngineControl};
use crate::error::{EngineError, LoopError, ScriptError};
use crate::host::HostCallbacks;
use crate::lifecycle::{AppId, AppState};
use crate::message::EngineCall;
use crate::message_loop::LoopShared;

/// Name of the script function that receives uncaught app errors.
const APP_ERROR_HANDLER: &str = "notifyAppError";

thread_local! {
    static CURRENT: RefCell<Option<Rc<LoopContext>>> = const { RefCell::new(None) };
}

/// Context of the loop with `loop_id`, if the calling thread runs it.
pub(crate) fn current(loop_id: u64) -> Option<Rc<LoopContext>> {
    CURRENT.with(|slot| {
        slot.borrow()
            .as_ref()
            .filter(|ctx| ctx.shared.id == loop_id)
            .cloned()
    })
}

pub(crate) fn install(ctx: Rc<LoopContext>) {
    CURRENT.with(|slot| *slot.borrow_mut() = Some(ctx));
}

pub(crate) fn uninstall() {
    CURRENT.with(|slot| slot.borrow_mut().take());
}

/// Engine, host and lifecycle state as seen from the loop thread.
pub struct LoopContext {
    pub(crate) shared: Arc<LoopShared>,
    engine: RefCell<Box<dyn Engine>>,
    host: Arc<dyn HostCallbacks>,
    control: Arc<dyn EngineControl>,
    app_id: Cell<Option<AppId>>,
    disposed: Cell<bool>,
}

impl LoopContext {
    pub(crate) fn new(
        shared: Arc<LoopShared>,
        engine: Box<dyn Engine>,
        host: Arc<dyn HostCallbacks>,
    ) -> Self {
        let control = engine.control();
        Self {
            shared,
            engine: RefCell::new(engine),
            host,
            control,
            app_id: Cell::new(None),
            disposed: Cell::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn host(&self) -> &Arc<dyn HostCallbacks> {
        &self.host
    }

    pub(crate) fn control(&self) -> Arc<dyn EngineControl> {
        self.control.clone()
    }

    pub fn app_state(&self) -> AppState {
        self.shared.state.get()
    }

    /// Run `f` with exclusive access to the engine. Fails with
    /// [`LoopError::EngineBusy`] when called from inside an engine
    /// operation on this same thread.
    pub fn with_engine<R>(&self, f: impl FnOnce(&mut dyn Engine) -> R) -> Result<R, LoopError> {
        if self.disposed.get() {
            return Err(LoopError::Stopped);
        }
        let mut engine = self.engine.try_borrow_mut().map_err(|_| LoopError::EngineBusy)?;
        Ok(f(engine.as_mut()))
    }

    /// Gate, dispatch and account for one engine operation. Returns the
    /// operation's result, or its fallback when it was dropped or faulted.
    pub(crate) fn process(&self, call: &EngineCall) -> Result<Value, LoopError> {
        let state = self.app_state();
        if call.is_app_scoped() && state.drops_at_dispatch() {
            debug!(
                "[{}] dropping {:?}: app state {:?}",
                self.name(),
                call.opcode(),
                state
            );
            return Ok(call.fallback());
        }

        let outcome = self.with_engine(|engine| call.dispatch(engine))?;

        match call {
            EngineCall::CreateApplication { app_id, .. } => self.app_id.set(Some(*app_id)),
            EngineCall::DestroyApplication { .. } => self.shared.state.set(AppState::Destroyed),
            _ => {}
        }

        match outcome {
            Ok(value) => Ok(value),
            Err(err) => {
                self.handle_engine_error(call, err);
                Ok(call.fallback())
            }
        }
    }

    fn handle_engine_error(&self, call: &EngineCall, err: EngineError) {
        match err {
            EngineError::Script(script) => self.process_script_error(script),
            EngineError::Channel(err) => {
                error!("[{}] channel fault during {:?}: {}", self.name(), call.opcode(), err)
            }
            EngineError::Unavailable(reason) => {
                warn!("[{}] {:?} not delivered: {}", self.name(), call.opcode(), reason)
            }
        }
    }

    /// Report a script fault to the host and the app, unless it is the
    /// expected result of an explicit termination.
    pub(crate) fn process_script_error(&self, err: ScriptError) {
        if err.terminated {
            self.control.clear_termination();
            if self.shared.expected_termination.swap(false, Ordering::SeqCst) {
                debug!("[{}] execution terminated as requested", self.name());
                return;
            }
        }

        error!(
            "[{}] script error: {}{}",
            self.name(),
            err.message,
            err.stack
                .as_deref()
                .map(|stack| format!("\n{}", stack))
                .unwrap_or_default()
        );
        self.host.on_script_error(&err);
        self.notify_app_error(&err);
    }

    fn notify_app_error(&self, err: &ScriptError) {
        let Some(app_id) = self.app_id.get() else {
            return;
        };
        if self.app_state() != AppState::RuntimeInited {
            return;
        }
        let args = [
            Value::from(app_id),
            Value::String(err.message.clone()),
            err.stack.clone().map(Value::String).unwrap_or(Value::Null),
        ];
        // Failures inside the app's own handler are only logged.
        match self.with_engine(|engine| engine.execute_void_function(APP_ERROR_HANDLER, &args)) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("[{}] {} failed: {}", self.name(), APP_ERROR_HANDLER, err),
            Err(err) => debug!("[{}] {} skipped: {}", self.name(), APP_ERROR_HANDLER, err),
        }
    }

    /// Dispose the engine. Later calls are no-ops.
    pub(crate) fn dispose(&self) {
        if self.disposed.get() {
            return;
        }
        match self.engine.try_borrow_mut() {
            Ok(mut engine) => {
                if let Err(err) = engine.shutdown() {
                    warn!("[{}] engine shutdown failed: {}", self.name(), err);
                }
            }
            Err(_) => warn!("[{}] engine busy during dispose", self.name()),
        }
        self.disposed.set(true);
        self.shared.state.set(AppState::Destroyed);
        debug!("[{}] engine disposed", self.name());
    }
}
