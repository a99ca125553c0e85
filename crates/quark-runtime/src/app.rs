//! Application runtime facade.
//!
//! Owns one application's message loop and page table. Every operation is
//! gated on lifecycle state here and then queued to the loop; the engine
//! behind the loop is either in-process QuickJS or a sandbox proxy.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{Backend, QuarkConfig};
use crate::engine::{Engine, PageLaunch};
use crate::error::{RuntimeError, ScriptError};
use crate::host::HostCallbacks;
use crate::inprocess::QuickJsEngine;
use crate::lifecycle::{AppId, AppState, PageId, PageRegistry, PageState, next_app_id};
use crate::message::EngineCall;
use crate::message_loop::MessageLoop;
use crate::types::{
    ConfigurationKind, FeatureRequest, FeatureResponse, JsCallback, JsEvent, KeyEvent, Locale,
    Orientation,
};

#[cfg(unix)]
use crate::launcher::ProcessLauncher;

/// A running application.
pub struct AppRuntime {
    app_id: AppId,
    message_loop: MessageLoop,
    pages: Arc<PageRegistry>,
    shutting_down: AtomicBool,
}

impl AppRuntime {
    /// Start on the backend named by `config.engine.backend`.
    pub fn start(config: &QuarkConfig, host: Arc<dyn HostCallbacks>) -> Result<Self, RuntimeError> {
        match config.engine.backend {
            Backend::InProcess => Self::in_process(config, host),
            #[cfg(unix)]
            Backend::Sandbox => {
                let launcher = ProcessLauncher::new(config)?;
                Self::sandboxed(config, host, launcher)
            }
            #[cfg(not(unix))]
            Backend::Sandbox => Err(RuntimeError::SandboxUnsupported),
        }
    }

    /// Run scripts on a QuickJS engine inside this process.
    pub fn in_process(config: &QuarkConfig, host: Arc<dyn HostCallbacks>) -> Result<Self, RuntimeError> {
        let app_id = next_app_id();
        let pages = Arc::new(PageRegistry::new());
        let host = PageTracker::wrap(host, pages.clone());
        let message_loop = MessageLoop::spawn(
            format!("app-{}", app_id),
            QuickJsEngine::factory(config.engine.clone(), host),
        )?;
        info!("[AppRuntime::in_process] app {} started", app_id);
        Ok(Self::with_loop(app_id, message_loop, pages))
    }

    /// Run scripts in a sandbox process bound through `launcher`.
    #[cfg(unix)]
    pub fn sandboxed(
        config: &QuarkConfig,
        host: Arc<dyn HostCallbacks>,
        launcher: Arc<ProcessLauncher>,
    ) -> Result<Self, RuntimeError> {
        let app_id = next_app_id();
        let (positive, passive) = launcher.take_channel_descriptors()?;
        let channel = config.channel.clone();
        let pages = Arc::new(PageRegistry::new());
        let host = PageTracker::wrap(host, pages.clone());

        let message_loop = MessageLoop::spawn(format!("app-{}", app_id), move || {
            let engine = crate::sandbox::connect_app(positive, passive, host.clone(), &channel)?;
            launcher.watch_channel(engine.failure_handle());
            let faulted = launcher.clone();
            engine.on_disconnect(move |reason| {
                faulted.report_channel_fault(&format!("sandbox channel lost: {}", reason));
            });
            let engine = engine.with_shutdown_hook(move || launcher.stop());
            let engine: Box<dyn Engine> = Box::new(engine);
            Ok((engine, host))
        })?;
        info!("[AppRuntime::sandboxed] app {} started", app_id);
        Ok(Self::with_loop(app_id, message_loop, pages))
    }

    fn with_loop(app_id: AppId, message_loop: MessageLoop, pages: Arc<PageRegistry>) -> Self {
        Self {
            app_id,
            message_loop,
            pages,
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> AppId {
        self.app_id
    }

    pub fn state(&self) -> AppState {
        self.message_loop.app_state()
    }

    pub fn message_loop(&self) -> &MessageLoop {
        &self.message_loop
    }

    pub fn page_state(&self, page_id: PageId) -> PageState {
        self.pages.state(page_id)
    }

    pub fn current_page(&self) -> Option<PageId> {
        self.pages.current()
    }

    /// Wait up to `timeout` for a created page to finish its first render.
    /// False if the page failed to build, was destroyed, or is still
    /// building.
    pub fn wait_page_initialized(&self, page_id: PageId, timeout: Duration) -> bool {
        self.pages.wait_initialized(page_id, timeout)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Application
    // ─────────────────────────────────────────────────────────────────────

    pub fn attach(&self, environment_script: &str, package: &str) {
        self.message_loop.post(EngineCall::Attach {
            environment_script: environment_script.to_string(),
            package: package.to_string(),
        });
    }

    pub fn create_application(&self, script: &str, style: &str, meta: Value) {
        self.message_loop.post(EngineCall::CreateApplication {
            app_id: self.app_id,
            script: script.to_string(),
            style: style.to_string(),
            meta,
        });
    }

    pub fn request_application(&self) {
        self.message_loop.post(EngineCall::RequestApplication { app_id: self.app_id });
    }

    pub fn show_application(&self) {
        self.message_loop.post(EngineCall::ShowApplication { app_id: self.app_id });
    }

    pub fn hide_application(&self) {
        self.message_loop.post(EngineCall::HideApplication { app_id: self.app_id });
    }

    pub fn notify_page_not_found(&self, uri: &str) {
        self.message_loop.post(EngineCall::PageNotFound {
            app_id: self.app_id,
            uri: uri.to_string(),
        });
    }

    pub fn update_locale(&self, locale: Locale, resources: Value) {
        self.message_loop.post(EngineCall::UpdateLocale { locale, resources });
    }

    pub fn notify_configuration_changed(&self, page_id: PageId, kind: ConfigurationKind) {
        self.message_loop
            .post(EngineCall::ConfigurationChanged { page_id, kind });
    }

    pub fn register_bundle_chunks(&self, content: &str) {
        self.message_loop.post(EngineCall::RegisterBundleChunks {
            content: content.to_string(),
        });
    }

    pub fn register_components(&self, components: Value) {
        self.message_loop
            .post(EngineCall::RegisterComponents { components });
    }

    // ─────────────────────────────────────────────────────────────────────
    // Pages
    // ─────────────────────────────────────────────────────────────────────

    /// Build a page. It becomes `Initialized` when the engine reports its
    /// first render; a page whose script fails stays `Created`.
    pub fn create_page(&self, mut page: PageLaunch) {
        if self.state().refuses_admission() {
            debug!("[AppRuntime] page {} refused: shutting down", page.page_id);
            return;
        }
        page.app_id = self.app_id;
        self.pages.mark_created(page.page_id);
        self.message_loop.post(EngineCall::CreatePage(page));
    }

    pub fn recreate_page(&self, page_id: PageId) {
        if self.pages.accepts_input(page_id) {
            self.message_loop.post(EngineCall::RecreatePage { page_id });
        }
    }

    pub fn refresh_page(&self, page_id: PageId, params: Value, intent: Value) {
        if self.pages.accepts_input(page_id) {
            self.message_loop.post(EngineCall::RefreshPage {
                page_id,
                params,
                intent,
            });
        }
    }

    /// Show or hide a page. Ignored unless the page is in a state that
    /// allows the transition. Nothing is shown while the loop is blocked.
    pub fn change_visible_page(&self, page_id: PageId, visible: bool) {
        if visible && self.message_loop.is_blocked() {
            debug!("[AppRuntime] show of page {} ignored while blocked", page_id);
            return;
        }
        if self.pages.set_visible(page_id, visible) {
            self.message_loop
                .post(EngineCall::ChangeVisiblePage { page_id, visible });
        } else {
            debug!(
                "[AppRuntime] visibility {} ignored for page {} in {:?}",
                visible,
                page_id,
                self.pages.state(page_id)
            );
        }
    }

    pub fn destroy_page(&self, page_id: PageId) {
        if self.pages.remove(page_id) > PageState::None {
            self.message_loop.post(EngineCall::DestroyPage { page_id });
        }
    }

    pub fn orientation_change(&self, page_id: PageId, orientation: Orientation) {
        if self.pages.accepts_input(page_id) {
            self.message_loop.post(EngineCall::OrientationChange {
                page_id,
                orientation,
            });
        }
    }

    pub fn page_scroll(&self, page_id: PageId, scroll_top: i32) {
        if self.pages.accepts_input(page_id) {
            self.message_loop.post(EngineCall::PageScroll {
                page_id,
                scroll_top,
            });
        }
    }

    pub fn reach_page_top(&self, page_id: PageId) {
        if self.pages.accepts_input(page_id) {
            self.message_loop.post(EngineCall::ReachPageTop { page_id });
        }
    }

    pub fn reach_page_bottom(&self, page_id: PageId) {
        if self.pages.accepts_input(page_id) {
            self.message_loop.post(EngineCall::ReachPageBottom { page_id });
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Input
    // ─────────────────────────────────────────────────────────────────────

    pub fn fire_event(&self, events: Vec<JsEvent>) {
        let events: Vec<JsEvent> = events
            .into_iter()
            .filter(|event| self.pages.accepts_input(event.page_id))
            .collect();
        if !events.is_empty() {
            self.message_loop.post(EngineCall::FireEvent { events });
        }
    }

    pub fn fire_callback(&self, callback: JsCallback) {
        self.message_loop.post(EngineCall::FireCallback { callback });
    }

    /// Returns whether the page consumed the key.
    pub fn fire_key_event(&self, event: KeyEvent) -> bool {
        if !self.pages.accepts_input(event.page_id) {
            return false;
        }
        self.call_bool(EngineCall::FireKeyEvent { event })
    }

    /// Returns whether the page handled the press itself.
    pub fn back_press(&self, page_id: PageId) -> bool {
        self.pages.accepts_input(page_id) && self.call_bool(EngineCall::BackPress { page_id })
    }

    pub fn menu_press(&self, page_id: PageId) -> bool {
        self.pages.accepts_input(page_id) && self.call_bool(EngineCall::MenuPress { page_id })
    }

    pub fn menu_button_press(&self, page_id: PageId) -> bool {
        self.pages.accepts_input(page_id)
            && self.call_bool(EngineCall::MenuButtonPress { page_id })
    }

    fn call_bool(&self, call: EngineCall) -> bool {
        let opcode = call.opcode();
        match self.message_loop.call(call) {
            Ok(value) => value.as_bool().unwrap_or(false),
            Err(err) => {
                warn!("[AppRuntime] {:?} failed: {}", opcode, err);
                false
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Scripts
    // ─────────────────────────────────────────────────────────────────────

    pub fn execute_void_script(&self, script: &str, name: &str) {
        self.message_loop.post(EngineCall::ExecuteVoidScript {
            script: script.to_string(),
            name: name.to_string(),
        });
    }

    pub fn execute_void_function(&self, name: &str, args: Vec<Value>) {
        self.message_loop.post(EngineCall::ExecuteVoidFunction {
            name: name.to_string(),
            args,
        });
    }

    /// Evaluate `script` and return its result as JSON text; empty on
    /// failure.
    pub fn execute_object_script_and_stringify(&self, script: &str) -> String {
        let call = EngineCall::ExecuteObjectScriptAndStringify {
            script: script.to_string(),
        };
        match self.message_loop.call(call) {
            Ok(Value::String(json)) => json,
            Ok(_) => String::new(),
            Err(err) => {
                warn!("[AppRuntime] stringify failed: {}", err);
                String::new()
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Control
    // ─────────────────────────────────────────────────────────────────────

    pub fn block(&self, delay: Duration) {
        self.message_loop.block(delay);
    }

    pub fn unblock(&self) {
        self.message_loop.unblock();
    }

    pub fn terminate_execution(&self) {
        self.message_loop.terminate_execution();
    }

    /// Tear the application down and stop the loop after `delay`. Only the
    /// first call has an effect.
    pub fn shutdown(&self, delay: Duration) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.message_loop.unblock();

        if self
            .message_loop
            .state_cell()
            .transition(AppState::RuntimeInited, AppState::Destroying)
        {
            if let Some(page_id) = self.pages.current() {
                if self.pages.state(page_id) == PageState::Visible {
                    self.message_loop.post_unchecked(EngineCall::ChangeVisiblePage {
                        page_id,
                        visible: false,
                    });
                }
                self.pages.remove(page_id);
                self.message_loop
                    .post_unchecked(EngineCall::DestroyPage { page_id });
            }
            self.message_loop
                .post_unchecked(EngineCall::DestroyApplication { app_id: self.app_id });
        }

        info!("[AppRuntime::shutdown] app {} in {:?}", self.app_id, delay);
        self.message_loop.shutdown(delay);
    }

    /// Wait until everything queued so far has been processed.
    pub fn flush(&self) -> Result<(), RuntimeError> {
        Ok(self.message_loop.post_and_wait(|_| ())?)
    }

    /// Wait for the loop thread to finish.
    pub fn join(&self) -> Result<(), RuntimeError> {
        Ok(self.message_loop.join()?)
    }
}

impl Drop for AppRuntime {
    fn drop(&mut self) {
        self.shutdown(Duration::ZERO);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Page tracking
// ─────────────────────────────────────────────────────────────────────────────

/// Host wrapper that marks a page `Initialized` on its first render report,
/// then forwards every callback unchanged.
struct PageTracker {
    inner: Arc<dyn HostCallbacks>,
    pages: Arc<PageRegistry>,
}

impl PageTracker {
    fn wrap(inner: Arc<dyn HostCallbacks>, pages: Arc<PageRegistry>) -> Arc<dyn HostCallbacks> {
        Arc::new(Self { inner, pages })
    }
}

impl HostCallbacks for PageTracker {
    fn resolve_view_id(&self, element_ref: i32) -> i32 {
        self.inner.resolve_view_id(element_ref)
    }

    fn read_debug_asset(&self, path: &str) -> Option<String> {
        self.inner.read_debug_asset(path)
    }

    fn on_key_event_handled(&self, consumed: bool, hash: i32) {
        self.inner.on_key_event_handled(consumed, hash)
    }

    fn invoke_feature(&self, request: FeatureRequest) -> FeatureResponse {
        self.inner.invoke_feature(request)
    }

    fn router_back(&self) {
        self.inner.router_back()
    }

    fn router_push(&self, uri: &str, params: &Value) {
        self.inner.router_push(uri, params)
    }

    fn router_replace(&self, uri: &str, params: &Value) {
        self.inner.router_replace(uri, params)
    }

    fn router_clear(&self) {
        self.inner.router_clear()
    }

    fn render_actions(&self, page_id: PageId, actions: &str) {
        self.pages.mark_initialized(page_id);
        self.inner.render_actions(page_id, actions)
    }

    fn on_script_error(&self, error: &ScriptError) {
        self.inner.on_script_error(error)
    }

    fn profiler_is_enabled(&self) -> bool {
        self.inner.profiler_is_enabled()
    }

    fn profiler_record(&self, message: &str, thread_id: i64) {
        self.inner.profiler_record(message, thread_id)
    }

    fn profiler_time_start(&self, key: &str) {
        self.inner.profiler_time_start(key)
    }

    fn profiler_time_end(&self, key: &str) {
        self.inner.profiler_time_end(key)
    }

    fn profiler_save_data(&self, data: &str) {
        self.inner.profiler_save_data(data)
    }

    fn inspector_response(&self, session_id: i32, call_id: i32, message: &str) {
        self.inner.inspector_response(session_id, call_id, message)
    }

    fn inspector_notify(&self, session_id: i32, message: &str) {
        self.inner.inspector_notify(session_id, message)
    }

    fn inspector_run_message_loop_on_pause(&self, context_group_id: i32) {
        self.inner.inspector_run_message_loop_on_pause(context_group_id)
    }

    fn inspector_quit_message_loop_on_pause(&self) {
        self.inner.inspector_quit_message_loop_on_pause()
    }
}
