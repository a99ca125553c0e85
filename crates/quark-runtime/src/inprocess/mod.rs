//! In-process QuickJS backend.
//!
//! The engine evaluates the framework script once, then drives it by
//! calling its global entry points with JSON-literal arguments. Host
//! callbacks are reachable from scripts through the `quark` global.

mod globals;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rquickjs::{Context, Ctx, Runtime};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::engine::{Engine, EngineControl, PageLaunch};
use crate::error::{EngineError, EngineResult, ScriptError};
use crate::host::HostCallbacks;
use crate::lifecycle::{AppId, PageId};
use crate::message_loop::EngineFactory;
use crate::types::{ConfigurationKind, JsCallback, JsEvent, KeyEvent, Locale, Orientation};

pub use globals::register_quark_globals;

/// Framework script evaluated into every fresh engine.
pub const FRAMEWORK_SCRIPT: &str = include_str!("framework.js");

/// Page id used for batches that are not addressed to a page.
const NO_PAGE: PageId = -1;

// ─────────────────────────────────────────────────────────────────────────────
// Interrupt control
// ─────────────────────────────────────────────────────────────────────────────

/// Interrupt flag polled by the QuickJS interrupt handler. A request only
/// takes effect while a script is executing.
#[derive(Debug, Default)]
pub struct InterruptControl {
    requested: AtomicBool,
    executing: AtomicBool,
}

impl InterruptControl {
    fn should_interrupt(&self) -> bool {
        self.executing.load(Ordering::SeqCst) && self.requested.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        self.executing.store(true, Ordering::SeqCst);
    }

    /// Leave script execution. Returns whether an interrupt was requested
    /// during it.
    fn leave(&self) -> bool {
        self.executing.store(false, Ordering::SeqCst);
        self.requested.swap(false, Ordering::SeqCst)
    }
}

impl EngineControl for InterruptControl {
    fn terminate_execution(&self) -> bool {
        if !self.executing.load(Ordering::SeqCst) {
            return false;
        }
        self.requested.store(true, Ordering::SeqCst);
        true
    }

    fn clear_termination(&self) {
        self.requested.store(false, Ordering::SeqCst);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

/// A QuickJS engine owned by one message loop.
pub struct QuickJsEngine {
    runtime: Runtime,
    context: Context,
    host: Arc<dyn HostCallbacks>,
    control: Arc<InterruptControl>,
}

impl QuickJsEngine {
    pub fn new(config: &EngineConfig, host: Arc<dyn HostCallbacks>) -> EngineResult<Self> {
        let framework = match &config.framework {
            Some(path) => std::fs::read_to_string(path).map_err(|e| {
                EngineError::Unavailable(format!("cannot read {}: {}", path.display(), e))
            })?,
            None => FRAMEWORK_SCRIPT.to_string(),
        };

        let runtime = Runtime::new().map_err(|e| EngineError::Unavailable(e.to_string()))?;
        if config.memory_limit_mb > 0 {
            runtime.set_memory_limit(config.memory_limit_bytes());
        }
        if config.max_stack_kb > 0 {
            runtime.set_max_stack_size(config.max_stack_bytes());
        }

        let control = Arc::new(InterruptControl::default());
        let handler_control = control.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || handler_control.should_interrupt())));

        let context = Context::full(&runtime).map_err(|e| EngineError::Unavailable(e.to_string()))?;
        context
            .with(|ctx| register_quark_globals(&ctx, host.clone()))
            .map_err(|e| EngineError::Unavailable(format!("failed to register globals: {}", e)))?;

        let engine = Self {
            runtime,
            context,
            host,
            control,
        };
        engine.eval_void(&framework, "framework.js")?;
        debug!("[QuickJsEngine::new] framework loaded");
        Ok(engine)
    }

    /// A factory that builds the engine on the loop thread.
    pub fn factory(config: EngineConfig, host: Arc<dyn HostCallbacks>) -> EngineFactory {
        Box::new(move || {
            let engine = QuickJsEngine::new(&config, host.clone())?;
            let engine: Box<dyn Engine> = Box::new(engine);
            Ok((engine, host))
        })
    }

    /// Run `f` against the context as one script execution: interruptible,
    /// with thrown values turned into [`ScriptError`]s and pending jobs
    /// drained afterwards.
    fn run<R>(
        &self,
        name: &str,
        f: impl for<'js> FnOnce(&Ctx<'js>) -> rquickjs::Result<R>,
    ) -> EngineResult<R> {
        self.control.enter();
        let result = self.context.with(|ctx| f(&ctx).map_err(|e| script_error(&ctx, e, name)));
        if result.is_ok() {
            self.drain_jobs();
        }
        let interrupted = self.control.leave();

        result.map_err(|err| {
            if interrupted {
                err.interrupted().into()
            } else {
                err.into()
            }
        })
    }

    fn drain_jobs(&self) {
        loop {
            match self.runtime.execute_pending_job() {
                Ok(true) => continue,
                Ok(false) => break,
                Err(_) => {
                    warn!("[QuickJsEngine] pending job threw");
                }
            }
        }
    }

    fn eval_void(&self, source: &str, name: &str) -> EngineResult<()> {
        self.run(name, |ctx| ctx.eval::<(), _>(source))
    }

    fn call_void(&self, function: &str, args: &[Value]) -> EngineResult<()> {
        let source = invocation(function, args);
        self.run(function, |ctx| ctx.eval::<(), _>(source))
    }

    fn call_bool(&self, function: &str, args: &[Value]) -> EngineResult<bool> {
        let source = invocation(function, args);
        self.run(function, |ctx| {
            ctx.eval::<rquickjs::Value, _>(source)
                .map(|value| value.as_bool().unwrap_or(false))
        })
    }
}

/// `function(arg, ...)` with every argument as a JSON literal.
fn invocation(function: &str, args: &[Value]) -> String {
    let args: Vec<String> = args.iter().map(Value::to_string).collect();
    format!("{}({});", function, args.join(","))
}

/// Take the pending exception off the context.
fn script_error(ctx: &Ctx<'_>, err: rquickjs::Error, name: &str) -> ScriptError {
    if !matches!(err, rquickjs::Error::Exception) {
        return ScriptError::new(format!("{}: {}", name, err));
    }

    let thrown = ctx.catch();
    if let Some(exception) = thrown.as_exception() {
        let message = exception
            .message()
            .unwrap_or_else(|| "uncaught exception".to_string());
        return ScriptError::new(message).with_stack(exception.stack());
    }

    let rendered = ctx
        .json_stringify(thrown)
        .ok()
        .flatten()
        .and_then(|s| s.to_string().ok())
        .unwrap_or_else(|| "undefined".to_string());
    ScriptError::new(format!("uncaught {} in {}", rendered, name))
}

/// Group events into per-page batches, keeping their order.
fn event_batches(events: &[JsEvent]) -> Vec<(PageId, Vec<Value>)> {
    let mut batches: Vec<(PageId, Vec<Value>)> = Vec::new();
    for event in events {
        let action = json!({
            "action": 1,
            "args": [event.element_ref, event.event_type, event.params, event.attributes],
        });
        match batches.last_mut() {
            Some((page_id, actions)) if *page_id == event.page_id => actions.push(action),
            _ => batches.push((event.page_id, vec![action])),
        }
    }
    batches
}

impl Engine for QuickJsEngine {
    fn attach(&mut self, environment_script: &str, package: &str) -> EngineResult<()> {
        if !environment_script.is_empty() {
            self.eval_void(environment_script, "environment")?;
        }
        self.call_void("initInfras", &[json!(package)])
    }

    fn create_application(
        &mut self,
        app_id: AppId,
        script: &str,
        style: &str,
        meta: &Value,
    ) -> EngineResult<()> {
        self.call_void(
            "createApplication",
            &[json!(app_id), json!(script), json!(style), meta.clone()],
        )
    }

    fn destroy_application(&mut self, app_id: AppId) -> EngineResult<()> {
        self.call_void("destroyApplication", &[json!(app_id)])
    }

    fn request_application(&mut self, app_id: AppId) -> EngineResult<()> {
        self.call_void("onRequestApplication", &[json!(app_id)])
    }

    fn show_application(&mut self, app_id: AppId) -> EngineResult<()> {
        self.call_void("onShowApplication", &[json!(app_id)])
    }

    fn hide_application(&mut self, app_id: AppId) -> EngineResult<()> {
        self.call_void("onHideApplication", &[json!(app_id)])
    }

    fn create_page(&mut self, page: &PageLaunch) -> EngineResult<()> {
        self.call_void(
            "createPage",
            &[
                json!(page.page_id),
                json!(page.app_id),
                json!(page.script),
                page.params.clone(),
                page.intent.clone(),
                page.meta.clone(),
                json!(page.style),
            ],
        )
    }

    fn recreate_page(&mut self, page_id: PageId) -> EngineResult<()> {
        self.call_void("recreatePage", &[json!(page_id)])
    }

    fn refresh_page(&mut self, page_id: PageId, params: &Value, intent: &Value) -> EngineResult<()> {
        self.call_void(
            "refreshPage",
            &[json!(page_id), params.clone(), intent.clone()],
        )
    }

    fn destroy_page(&mut self, page_id: PageId) -> EngineResult<()> {
        self.call_void("destroyPage", &[json!(page_id)])
    }

    fn notify_page_not_found(&mut self, app_id: AppId, uri: &str) -> EngineResult<()> {
        self.call_void("notifyPageNotFound", &[json!(app_id), json!({ "uri": uri })])
    }

    fn change_visible_page(&mut self, page_id: PageId, visible: bool) -> EngineResult<()> {
        self.call_void("changeVisiblePage", &[json!(page_id), json!(visible)])
    }

    fn fire_event(&mut self, events: &[JsEvent]) -> EngineResult<()> {
        for (page_id, actions) in event_batches(events) {
            self.call_void("execJSBatch", &[json!(page_id), Value::Array(actions)])?;
        }
        Ok(())
    }

    fn fire_key_event(&mut self, event: &KeyEvent) -> EngineResult<bool> {
        let consumed = self.call_bool(
            "keyPressPage",
            &[
                json!(event.page_id),
                json!({
                    "ref": event.element_ref,
                    "code": event.code,
                    "action": event.action,
                    "repeatCount": event.repeat_count,
                }),
            ],
        )?;
        self.host.on_key_event_handled(consumed, event.hash);
        Ok(consumed)
    }

    fn fire_callback(&mut self, callback: &JsCallback) -> EngineResult<()> {
        let action = json!({
            "action": 2,
            "args": [callback.callback_id, [callback.data]],
        });
        self.call_void("execJSBatch", &[json!(NO_PAGE), json!([action])])
    }

    fn back_press(&mut self, page_id: PageId) -> EngineResult<bool> {
        self.call_bool("backPressPage", &[json!(page_id)])
    }

    fn menu_press(&mut self, page_id: PageId) -> EngineResult<bool> {
        self.call_bool("menuPressPage", &[json!(page_id)])
    }

    fn menu_button_press(&mut self, page_id: PageId) -> EngineResult<bool> {
        self.call_bool("menuButtonPressPage", &[json!(page_id)])
    }

    fn orientation_change(&mut self, page_id: PageId, orientation: Orientation) -> EngineResult<()> {
        self.call_void(
            "orientationChangePage",
            &[json!(page_id), json!({ "orientation": orientation.as_str() })],
        )
    }

    fn page_scroll(&mut self, page_id: PageId, scroll_top: i32) -> EngineResult<()> {
        self.call_void(
            "pageScroll",
            &[json!(page_id), json!({ "scrollTop": scroll_top })],
        )
    }

    fn reach_page_top(&mut self, page_id: PageId) -> EngineResult<()> {
        self.call_void("reachPageTop", &[json!(page_id)])
    }

    fn reach_page_bottom(&mut self, page_id: PageId) -> EngineResult<()> {
        self.call_void("reachPageBottom", &[json!(page_id)])
    }

    fn execute_void_script(&mut self, script: &str, name: &str) -> EngineResult<()> {
        self.eval_void(script, name)
    }

    fn execute_void_function(&mut self, name: &str, args: &[Value]) -> EngineResult<()> {
        self.call_void(name, args)
    }

    fn execute_object_script_and_stringify(&mut self, script: &str) -> EngineResult<String> {
        self.run("stringify", |ctx| {
            let value: rquickjs::Value = ctx.eval(script)?;
            let json = ctx.json_stringify(value)?;
            Ok(match json {
                Some(json) => json.to_string()?,
                None => String::new(),
            })
        })
    }

    fn update_locale(&mut self, locale: &Locale, resources: &Value) -> EngineResult<()> {
        self.call_void(
            "changeAppLocale",
            &[
                json!({ "language": locale.language, "countryOrRegion": locale.country }),
                resources.clone(),
            ],
        )
    }

    fn notify_configuration_changed(
        &mut self,
        page_id: PageId,
        kind: ConfigurationKind,
    ) -> EngineResult<()> {
        self.call_void(
            "notifyConfigurationChanged",
            &[json!(page_id), json!({ "type": kind.as_str() })],
        )
    }

    fn register_bundle_chunks(&mut self, content: &str) -> EngineResult<()> {
        self.call_void("registerBundleChunks", &[json!(content)])
    }

    fn register_components(&mut self, components: &Value) -> EngineResult<()> {
        self.call_void("registerComponents", &[components.clone()])
    }

    fn control(&self) -> Arc<dyn EngineControl> {
        self.control.clone()
    }

    fn shutdown(&mut self) -> EngineResult<()> {
        self.runtime.run_gc();
        debug!("[QuickJsEngine::shutdown] disposed");
        Ok(())
    }
}
