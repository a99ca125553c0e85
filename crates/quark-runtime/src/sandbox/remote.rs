//! Proxies that forward engine operations and host callbacks over the
//! duplex channel.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::channel::{ChannelReceiver, ChannelSender, FailureHandle, codec};
use crate::engine::{Engine, EngineControl, PageLaunch};
use crate::error::{EngineResult, ScriptError};
use crate::host::HostCallbacks;
use crate::lifecycle::{AppId, PageId};
use crate::message::{EngineCall, HostCall, Opcode};
use crate::types::{
    ConfigurationKind, FeatureRequest, FeatureResponse, JsCallback, JsEvent, KeyEvent, Locale,
    Orientation,
};

/// Hook run right before the remote engine is told to shut down.
pub type ShutdownHook = Box<dyn FnOnce() + Send>;

// ─────────────────────────────────────────────────────────────────────────────
// Remote engine (app side)
// ─────────────────────────────────────────────────────────────────────────────

/// Control frames that act on the peer immediately, bypassing the app-side
/// mailbox.
pub struct RemoteControl {
    sender: Arc<ChannelSender>,
}

impl RemoteControl {
    fn signal(&self, opcode: Opcode) -> bool {
        match self.sender.post(opcode as u32, Vec::new()) {
            Ok(()) => true,
            Err(err) => {
                warn!("[RemoteControl] {:?} not delivered: {}", opcode, err);
                false
            }
        }
    }
}

impl EngineControl for RemoteControl {
    /// The sandbox's own loop expects and swallows the interrupt, so
    /// nothing is left for the app side to swallow.
    fn terminate_execution(&self) -> bool {
        self.signal(Opcode::TerminateExecution);
        false
    }

    fn unblock(&self) {
        self.signal(Opcode::Unblock);
    }
}

/// An [`Engine`] whose scripts run in a sandbox process.
pub struct RemoteEngine {
    sender: Arc<ChannelSender>,
    control: Arc<RemoteControl>,
    /// Serves the peer's host callbacks for as long as the engine lives.
    host_receiver: Option<ChannelReceiver>,
    on_shutdown: Option<ShutdownHook>,
}

impl RemoteEngine {
    pub fn new(sender: Arc<ChannelSender>, host_receiver: ChannelReceiver) -> Self {
        Self {
            control: Arc::new(RemoteControl {
                sender: sender.clone(),
            }),
            sender,
            host_receiver: Some(host_receiver),
            on_shutdown: None,
        }
    }

    /// Run `hook` before the shutdown frame goes out. Used to disarm the
    /// launcher's death watch.
    pub fn with_shutdown_hook(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_shutdown = Some(Box::new(hook));
        self
    }

    /// Run `hook` once if the engine channel breaks before an orderly
    /// shutdown.
    pub fn on_disconnect(&self, hook: impl FnOnce(String) + Send + 'static) {
        self.sender.on_disconnect(hook);
    }

    /// Handle for failing this engine's outstanding calls from outside.
    pub fn failure_handle(&self) -> FailureHandle {
        self.sender.failure_handle()
    }

    fn forward(&self, call: EngineCall) -> EngineResult<Value> {
        let opcode = call.opcode() as u32;
        let payload = codec::encode(&call)?;
        if call.expects_reply() {
            let reply = self.sender.call(opcode, payload)?;
            Ok(codec::decode(&reply)?)
        } else {
            self.sender.post(opcode, payload)?;
            Ok(Value::Null)
        }
    }

    fn forward_unit(&self, call: EngineCall) -> EngineResult<()> {
        self.forward(call).map(|_| ())
    }

    fn forward_bool(&self, call: EngineCall) -> EngineResult<bool> {
        Ok(self.forward(call)?.as_bool().unwrap_or(false))
    }
}

impl Engine for RemoteEngine {
    fn attach(&mut self, environment_script: &str, package: &str) -> EngineResult<()> {
        self.forward_unit(EngineCall::Attach {
            environment_script: environment_script.to_string(),
            package: package.to_string(),
        })
    }

    fn create_application(
        &mut self,
        app_id: AppId,
        script: &str,
        style: &str,
        meta: &Value,
    ) -> EngineResult<()> {
        self.forward_unit(EngineCall::CreateApplication {
            app_id,
            script: script.to_string(),
            style: style.to_string(),
            meta: meta.clone(),
        })
    }

    fn destroy_application(&mut self, app_id: AppId) -> EngineResult<()> {
        self.forward_unit(EngineCall::DestroyApplication { app_id })
    }

    fn request_application(&mut self, app_id: AppId) -> EngineResult<()> {
        self.forward_unit(EngineCall::RequestApplication { app_id })
    }

    fn show_application(&mut self, app_id: AppId) -> EngineResult<()> {
        self.forward_unit(EngineCall::ShowApplication { app_id })
    }

    fn hide_application(&mut self, app_id: AppId) -> EngineResult<()> {
        self.forward_unit(EngineCall::HideApplication { app_id })
    }

    fn create_page(&mut self, page: &PageLaunch) -> EngineResult<()> {
        self.forward_unit(EngineCall::CreatePage(page.clone()))
    }

    fn recreate_page(&mut self, page_id: PageId) -> EngineResult<()> {
        self.forward_unit(EngineCall::RecreatePage { page_id })
    }

    fn refresh_page(&mut self, page_id: PageId, params: &Value, intent: &Value) -> EngineResult<()> {
        self.forward_unit(EngineCall::RefreshPage {
            page_id,
            params: params.clone(),
            intent: intent.clone(),
        })
    }

    fn destroy_page(&mut self, page_id: PageId) -> EngineResult<()> {
        self.forward_unit(EngineCall::DestroyPage { page_id })
    }

    fn notify_page_not_found(&mut self, app_id: AppId, uri: &str) -> EngineResult<()> {
        self.forward_unit(EngineCall::PageNotFound {
            app_id,
            uri: uri.to_string(),
        })
    }

    fn change_visible_page(&mut self, page_id: PageId, visible: bool) -> EngineResult<()> {
        self.forward_unit(EngineCall::ChangeVisiblePage { page_id, visible })
    }

    fn fire_event(&mut self, events: &[JsEvent]) -> EngineResult<()> {
        self.forward_unit(EngineCall::FireEvent {
            events: events.to_vec(),
        })
    }

    fn fire_key_event(&mut self, event: &KeyEvent) -> EngineResult<bool> {
        self.forward_bool(EngineCall::FireKeyEvent {
            event: event.clone(),
        })
    }

    fn fire_callback(&mut self, callback: &JsCallback) -> EngineResult<()> {
        self.forward_unit(EngineCall::FireCallback {
            callback: callback.clone(),
        })
    }

    fn back_press(&mut self, page_id: PageId) -> EngineResult<bool> {
        self.forward_bool(EngineCall::BackPress { page_id })
    }

    fn menu_press(&mut self, page_id: PageId) -> EngineResult<bool> {
        self.forward_bool(EngineCall::MenuPress { page_id })
    }

    fn menu_button_press(&mut self, page_id: PageId) -> EngineResult<bool> {
        self.forward_bool(EngineCall::MenuButtonPress { page_id })
    }

    fn orientation_change(&mut self, page_id: PageId, orientation: Orientation) -> EngineResult<()> {
        self.forward_unit(EngineCall::OrientationChange {
            page_id,
            orientation,
        })
    }

    fn page_scroll(&mut self, page_id: PageId, scroll_top: i32) -> EngineResult<()> {
        self.forward_unit(EngineCall::PageScroll {
            page_id,
            scroll_top,
        })
    }

    fn reach_page_top(&mut self, page_id: PageId) -> EngineResult<()> {
        self.forward_unit(EngineCall::ReachPageTop { page_id })
    }

    fn reach_page_bottom(&mut self, page_id: PageId) -> EngineResult<()> {
        self.forward_unit(EngineCall::ReachPageBottom { page_id })
    }

    fn execute_void_script(&mut self, script: &str, name: &str) -> EngineResult<()> {
        self.forward_unit(EngineCall::ExecuteVoidScript {
            script: script.to_string(),
            name: name.to_string(),
        })
    }

    fn execute_void_function(&mut self, name: &str, args: &[Value]) -> EngineResult<()> {
        self.forward_unit(EngineCall::ExecuteVoidFunction {
            name: name.to_string(),
            args: args.to_vec(),
        })
    }

    fn execute_object_script_and_stringify(&mut self, script: &str) -> EngineResult<String> {
        let value = self.forward(EngineCall::ExecuteObjectScriptAndStringify {
            script: script.to_string(),
        })?;
        Ok(match value {
            Value::String(json) => json,
            _ => String::new(),
        })
    }

    fn update_locale(&mut self, locale: &Locale, resources: &Value) -> EngineResult<()> {
        self.forward_unit(EngineCall::UpdateLocale {
            locale: locale.clone(),
            resources: resources.clone(),
        })
    }

    fn notify_configuration_changed(
        &mut self,
        page_id: PageId,
        kind: ConfigurationKind,
    ) -> EngineResult<()> {
        self.forward_unit(EngineCall::ConfigurationChanged { page_id, kind })
    }

    fn register_bundle_chunks(&mut self, content: &str) -> EngineResult<()> {
        self.forward_unit(EngineCall::RegisterBundleChunks {
            content: content.to_string(),
        })
    }

    fn register_components(&mut self, components: &Value) -> EngineResult<()> {
        self.forward_unit(EngineCall::RegisterComponents {
            components: components.clone(),
        })
    }

    fn block(&mut self) -> EngineResult<()> {
        self.sender.post(Opcode::Block as u32, Vec::new())?;
        Ok(())
    }

    fn control(&self) -> Arc<dyn EngineControl> {
        self.control.clone()
    }

    fn shutdown(&mut self) -> EngineResult<()> {
        if let Some(hook) = self.on_shutdown.take() {
            hook();
        }
        if let Err(err) = self.sender.post(Opcode::Shutdown as u32, Vec::new()) {
            debug!("[RemoteEngine::shutdown] peer already gone: {}", err);
        }
        self.sender.close();
        if let Some(receiver) = self.host_receiver.take() {
            receiver.close();
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Remote host (sandbox side)
// ─────────────────────────────────────────────────────────────────────────────

/// [`HostCallbacks`] that forward to the app process. Faults are logged and
/// answered with neutral defaults; the channel's disconnect handling takes
/// care of peer death.
pub struct RemoteHost {
    sender: Arc<ChannelSender>,
}

impl RemoteHost {
    pub fn new(sender: Arc<ChannelSender>) -> Self {
        Self { sender }
    }

    fn send(&self, call: HostCall) -> Option<Value> {
        let opcode = call.opcode();
        let payload = match codec::encode(&call) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("[RemoteHost] cannot encode {:?}: {}", opcode, err);
                return None;
            }
        };

        if !call.expects_reply() {
            if let Err(err) = self.sender.post(opcode as u32, payload) {
                warn!("[RemoteHost] {:?} not delivered: {}", opcode, err);
            }
            return None;
        }

        match self
            .sender
            .call(opcode as u32, payload)
            .and_then(|reply| codec::decode::<Value>(&reply))
        {
            Ok(value) => Some(value),
            Err(err) => {
                warn!("[RemoteHost] {:?} failed: {}", opcode, err);
                None
            }
        }
    }
}

impl HostCallbacks for RemoteHost {
    fn resolve_view_id(&self, element_ref: i32) -> i32 {
        self.send(HostCall::ResolveViewId { element_ref })
            .and_then(|v| v.as_i64())
            .map(|id| id as i32)
            .unwrap_or(-1)
    }

    fn read_debug_asset(&self, path: &str) -> Option<String> {
        self.send(HostCall::ReadDebugAsset {
            path: path.to_string(),
        })
        .and_then(|v| v.as_str().map(str::to_string))
    }

    fn on_key_event_handled(&self, consumed: bool, hash: i32) {
        self.send(HostCall::KeyEventHandled { consumed, hash });
    }

    fn invoke_feature(&self, request: FeatureRequest) -> FeatureResponse {
        let name = request.name.clone();
        match self.send(HostCall::InvokeFeature(request)) {
            Some(value) => serde_json::from_value(value)
                .unwrap_or_else(|e| FeatureResponse::error(format!("bad feature response: {}", e))),
            None => FeatureResponse::error(format!("{}: host unreachable", name)),
        }
    }

    fn router_back(&self) {
        self.send(HostCall::RouterBack);
    }

    fn router_push(&self, uri: &str, params: &Value) {
        self.send(HostCall::RouterPush {
            uri: uri.to_string(),
            params: params.clone(),
        });
    }

    fn router_replace(&self, uri: &str, params: &Value) {
        self.send(HostCall::RouterReplace {
            uri: uri.to_string(),
            params: params.clone(),
        });
    }

    fn router_clear(&self) {
        self.send(HostCall::RouterClear);
    }

    fn render_actions(&self, page_id: PageId, actions: &str) {
        self.send(HostCall::RenderActions {
            page_id,
            actions: actions.to_string(),
        });
    }

    fn on_script_error(&self, error: &ScriptError) {
        self.send(HostCall::ScriptError(error.clone()));
    }

    fn profiler_is_enabled(&self) -> bool {
        self.send(HostCall::ProfilerIsEnabled)
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    fn profiler_record(&self, message: &str, thread_id: i64) {
        self.send(HostCall::ProfilerRecord {
            message: message.to_string(),
            thread_id,
        });
    }

    fn profiler_time_start(&self, key: &str) {
        self.send(HostCall::ProfilerTimeStart {
            key: key.to_string(),
        });
    }

    fn profiler_time_end(&self, key: &str) {
        self.send(HostCall::ProfilerTimeEnd {
            key: key.to_string(),
        });
    }

    fn profiler_save_data(&self, data: &str) {
        self.send(HostCall::ProfilerSaveData {
            data: data.to_string(),
        });
    }

    fn inspector_response(&self, session_id: i32, call_id: i32, message: &str) {
        self.send(HostCall::InspectorResponse {
            session_id,
            call_id,
            message: message.to_string(),
        });
    }

    fn inspector_notify(&self, session_id: i32, message: &str) {
        self.send(HostCall::InspectorNotify {
            session_id,
            message: message.to_string(),
        });
    }

    fn inspector_run_message_loop_on_pause(&self, context_group_id: i32) {
        self.send(HostCall::InspectorRunMessageLoopOnPause { context_group_id });
    }

    fn inspector_quit_message_loop_on_pause(&self) {
        self.send(HostCall::InspectorQuitMessageLoopOnPause);
    }
}
