//! Typed operations and their wire opcodes.
//!
//! `EngineCall` is every operation the host drives against an engine;
//! `HostCall` is every callback the engine makes into its host. Both are
//! plain data so they can be queued on a message loop or carried across the
//! duplex channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::{Engine, PageLaunch};
use crate::error::{ChannelError, EngineResult, ScriptError};
use crate::host::HostCallbacks;
use crate::lifecycle::{AppId, PageId};
use crate::types::{
    ConfigurationKind, FeatureRequest, JsCallback, JsEvent, KeyEvent, Locale, Orientation,
};

// ─────────────────────────────────────────────────────────────────────────────
// Opcodes
// ─────────────────────────────────────────────────────────────────────────────

/// Wire opcodes.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // Host → engine
    Attach = 1,
    CreateApplication = 2,
    DestroyApplication = 3,
    RequestApplication = 4,
    ShowApplication = 5,
    HideApplication = 6,
    CreatePage = 7,
    RecreatePage = 8,
    RefreshPage = 9,
    DestroyPage = 10,
    PageNotFound = 11,
    ChangeVisiblePage = 12,
    FireEvent = 13,
    FireKeyEvent = 14,
    FireCallback = 15,
    BackPress = 16,
    MenuPress = 17,
    MenuButtonPress = 18,
    OrientationChange = 19,
    PageScroll = 20,
    ReachPageTop = 21,
    ReachPageBottom = 22,
    ExecuteVoidScript = 23,
    ExecuteVoidFunction = 24,
    ExecuteObjectScriptAndStringify = 25,
    UpdateLocale = 26,
    ConfigurationChanged = 27,
    RegisterBundleChunks = 28,
    RegisterComponents = 29,

    // Host → engine control
    Block = 40,
    Unblock = 41,
    TerminateExecution = 42,
    Shutdown = 43,

    // Engine → host
    ResolveViewId = 101,
    ReadDebugAsset = 102,
    KeyEventHandled = 103,
    InvokeFeature = 104,
    RouterBack = 105,
    RouterPush = 106,
    RouterReplace = 107,
    RouterClear = 108,
    ProfilerIsEnabled = 109,
    ProfilerRecord = 110,
    ProfilerTimeStart = 111,
    ProfilerTimeEnd = 112,
    ProfilerSaveData = 113,
    InspectorResponse = 114,
    InspectorNotify = 115,
    InspectorRunMessageLoopOnPause = 116,
    InspectorQuitMessageLoopOnPause = 117,
    ScriptError = 118,
    RenderActions = 119,
}

impl Opcode {
    const ALL: [Opcode; 52] = [
        Opcode::Attach,
        Opcode::CreateApplication,
        Opcode::DestroyApplication,
        Opcode::RequestApplication,
        Opcode::ShowApplication,
        Opcode::HideApplication,
        Opcode::CreatePage,
        Opcode::RecreatePage,
        Opcode::RefreshPage,
        Opcode::DestroyPage,
        Opcode::PageNotFound,
        Opcode::ChangeVisiblePage,
        Opcode::FireEvent,
        Opcode::FireKeyEvent,
        Opcode::FireCallback,
        Opcode::BackPress,
        Opcode::MenuPress,
        Opcode::MenuButtonPress,
        Opcode::OrientationChange,
        Opcode::PageScroll,
        Opcode::ReachPageTop,
        Opcode::ReachPageBottom,
        Opcode::ExecuteVoidScript,
        Opcode::ExecuteVoidFunction,
        Opcode::ExecuteObjectScriptAndStringify,
        Opcode::UpdateLocale,
        Opcode::ConfigurationChanged,
        Opcode::RegisterBundleChunks,
        Opcode::RegisterComponents,
        Opcode::Block,
        Opcode::Unblock,
        Opcode::TerminateExecution,
        Opcode::Shutdown,
        Opcode::ResolveViewId,
        Opcode::ReadDebugAsset,
        Opcode::KeyEventHandled,
        Opcode::InvokeFeature,
        Opcode::RouterBack,
        Opcode::RouterPush,
        Opcode::RouterReplace,
        Opcode::RouterClear,
        Opcode::ProfilerIsEnabled,
        Opcode::ProfilerRecord,
        Opcode::ProfilerTimeStart,
        Opcode::ProfilerTimeEnd,
        Opcode::ProfilerSaveData,
        Opcode::InspectorResponse,
        Opcode::InspectorNotify,
        Opcode::InspectorRunMessageLoopOnPause,
        Opcode::InspectorQuitMessageLoopOnPause,
        Opcode::ScriptError,
        Opcode::RenderActions,
    ];

    /// Control opcodes carry no payload and bypass the engine mailbox on the
    /// receiving side.
    pub fn is_control(self) -> bool {
        matches!(
            self,
            Opcode::Block | Opcode::Unblock | Opcode::TerminateExecution | Opcode::Shutdown
        )
    }
}

impl TryFrom<u32> for Opcode {
    type Error = ChannelError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Opcode::ALL
            .iter()
            .copied()
            .find(|op| *op as u32 == value)
            .ok_or_else(|| ChannelError::Protocol(format!("unknown opcode: {}", value)))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine calls
// ─────────────────────────────────────────────────────────────────────────────

/// One operation against an engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineCall {
    Attach {
        environment_script: String,
        package: String,
    },
    CreateApplication {
        app_id: AppId,
        script: String,
        style: String,
        meta: Value,
    },
    DestroyApplication {
        app_id: AppId,
    },
    RequestApplication {
        app_id: AppId,
    },
    ShowApplication {
        app_id: AppId,
    },
    HideApplication {
        app_id: AppId,
    },
    CreatePage(PageLaunch),
    RecreatePage {
        page_id: PageId,
    },
    RefreshPage {
        page_id: PageId,
        params: Value,
        intent: Value,
    },
    DestroyPage {
        page_id: PageId,
    },
    PageNotFound {
        app_id: AppId,
        uri: String,
    },
    ChangeVisiblePage {
        page_id: PageId,
        visible: bool,
    },
    FireEvent {
        events: Vec<JsEvent>,
    },
    FireKeyEvent {
        event: KeyEvent,
    },
    FireCallback {
        callback: JsCallback,
    },
    BackPress {
        page_id: PageId,
    },
    MenuPress {
        page_id: PageId,
    },
    MenuButtonPress {
        page_id: PageId,
    },
    OrientationChange {
        page_id: PageId,
        orientation: Orientation,
    },
    PageScroll {
        page_id: PageId,
        scroll_top: i32,
    },
    ReachPageTop {
        page_id: PageId,
    },
    ReachPageBottom {
        page_id: PageId,
    },
    ExecuteVoidScript {
        script: String,
        name: String,
    },
    ExecuteVoidFunction {
        name: String,
        args: Vec<Value>,
    },
    ExecuteObjectScriptAndStringify {
        script: String,
    },
    UpdateLocale {
        locale: Locale,
        resources: Value,
    },
    ConfigurationChanged {
        page_id: PageId,
        kind: ConfigurationKind,
    },
    RegisterBundleChunks {
        content: String,
    },
    RegisterComponents {
        components: Value,
    },
}

impl EngineCall {
    pub fn opcode(&self) -> Opcode {
        match self {
            EngineCall::Attach { .. } => Opcode::Attach,
            EngineCall::CreateApplication { .. } => Opcode::CreateApplication,
            EngineCall::DestroyApplication { .. } => Opcode::DestroyApplication,
            EngineCall::RequestApplication { .. } => Opcode::RequestApplication,
            EngineCall::ShowApplication { .. } => Opcode::ShowApplication,
            EngineCall::HideApplication { .. } => Opcode::HideApplication,
            EngineCall::CreatePage(_) => Opcode::CreatePage,
            EngineCall::RecreatePage { .. } => Opcode::RecreatePage,
            EngineCall::RefreshPage { .. } => Opcode::RefreshPage,
            EngineCall::DestroyPage { .. } => Opcode::DestroyPage,
            EngineCall::PageNotFound { .. } => Opcode::PageNotFound,
            EngineCall::ChangeVisiblePage { .. } => Opcode::ChangeVisiblePage,
            EngineCall::FireEvent { .. } => Opcode::FireEvent,
            EngineCall::FireKeyEvent { .. } => Opcode::FireKeyEvent,
            EngineCall::FireCallback { .. } => Opcode::FireCallback,
            EngineCall::BackPress { .. } => Opcode::BackPress,
            EngineCall::MenuPress { .. } => Opcode::MenuPress,
            EngineCall::MenuButtonPress { .. } => Opcode::MenuButtonPress,
            EngineCall::OrientationChange { .. } => Opcode::OrientationChange,
            EngineCall::PageScroll { .. } => Opcode::PageScroll,
            EngineCall::ReachPageTop { .. } => Opcode::ReachPageTop,
            EngineCall::ReachPageBottom { .. } => Opcode::ReachPageBottom,
            EngineCall::ExecuteVoidScript { .. } => Opcode::ExecuteVoidScript,
            EngineCall::ExecuteVoidFunction { .. } => Opcode::ExecuteVoidFunction,
            EngineCall::ExecuteObjectScriptAndStringify { .. } => {
                Opcode::ExecuteObjectScriptAndStringify
            }
            EngineCall::UpdateLocale { .. } => Opcode::UpdateLocale,
            EngineCall::ConfigurationChanged { .. } => Opcode::ConfigurationChanged,
            EngineCall::RegisterBundleChunks { .. } => Opcode::RegisterBundleChunks,
            EngineCall::RegisterComponents { .. } => Opcode::RegisterComponents,
        }
    }

    /// Application-scoped operations are gated on the application state.
    pub fn is_app_scoped(&self) -> bool {
        matches!(
            self,
            EngineCall::CreateApplication { .. }
                | EngineCall::DestroyApplication { .. }
                | EngineCall::CreatePage(_)
                | EngineCall::RecreatePage { .. }
                | EngineCall::RefreshPage { .. }
                | EngineCall::DestroyPage { .. }
                | EngineCall::PageNotFound { .. }
                | EngineCall::FireEvent { .. }
                | EngineCall::FireKeyEvent { .. }
                | EngineCall::FireCallback { .. }
                | EngineCall::BackPress { .. }
                | EngineCall::MenuPress { .. }
                | EngineCall::MenuButtonPress { .. }
                | EngineCall::OrientationChange { .. }
        )
    }

    /// Whether the caller waits for a result.
    pub fn expects_reply(&self) -> bool {
        matches!(
            self,
            EngineCall::FireKeyEvent { .. }
                | EngineCall::BackPress { .. }
                | EngineCall::MenuPress { .. }
                | EngineCall::MenuButtonPress { .. }
                | EngineCall::ExecuteObjectScriptAndStringify { .. }
        )
    }

    /// Result handed to a waiting caller when the operation faulted or was
    /// dropped.
    pub fn fallback(&self) -> Value {
        match self {
            EngineCall::ExecuteObjectScriptAndStringify { .. } => Value::String(String::new()),
            call if call.expects_reply() => Value::Bool(false),
            _ => Value::Null,
        }
    }

    /// Run this operation against `engine`.
    pub fn dispatch(&self, engine: &mut dyn Engine) -> EngineResult<Value> {
        let unit = |r: EngineResult<()>| r.map(|()| Value::Null);
        match self {
            EngineCall::Attach {
                environment_script,
                package,
            } => unit(engine.attach(environment_script, package)),
            EngineCall::CreateApplication {
                app_id,
                script,
                style,
                meta,
            } => unit(engine.create_application(*app_id, script, style, meta)),
            EngineCall::DestroyApplication { app_id } => {
                unit(engine.destroy_application(*app_id))
            }
            EngineCall::RequestApplication { app_id } => {
                unit(engine.request_application(*app_id))
            }
            EngineCall::ShowApplication { app_id } => unit(engine.show_application(*app_id)),
            EngineCall::HideApplication { app_id } => unit(engine.hide_application(*app_id)),
            EngineCall::CreatePage(page) => unit(engine.create_page(page)),
            EngineCall::RecreatePage { page_id } => unit(engine.recreate_page(*page_id)),
            EngineCall::RefreshPage {
                page_id,
                params,
                intent,
            } => unit(engine.refresh_page(*page_id, params, intent)),
            EngineCall::DestroyPage { page_id } => unit(engine.destroy_page(*page_id)),
            EngineCall::PageNotFound { app_id, uri } => {
                unit(engine.notify_page_not_found(*app_id, uri))
            }
            EngineCall::ChangeVisiblePage { page_id, visible } => {
                unit(engine.change_visible_page(*page_id, *visible))
            }
            EngineCall::FireEvent { events } => unit(engine.fire_event(events)),
            EngineCall::FireKeyEvent { event } => engine.fire_key_event(event).map(Value::Bool),
            EngineCall::FireCallback { callback } => unit(engine.fire_callback(callback)),
            EngineCall::BackPress { page_id } => engine.back_press(*page_id).map(Value::Bool),
            EngineCall::MenuPress { page_id } => engine.menu_press(*page_id).map(Value::Bool),
            EngineCall::MenuButtonPress { page_id } => {
                engine.menu_button_press(*page_id).map(Value::Bool)
            }
            EngineCall::OrientationChange {
                page_id,
                orientation,
            } => unit(engine.orientation_change(*page_id, *orientation)),
            EngineCall::PageScroll {
                page_id,
                scroll_top,
            } => unit(engine.page_scroll(*page_id, *scroll_top)),
            EngineCall::ReachPageTop { page_id } => unit(engine.reach_page_top(*page_id)),
            EngineCall::ReachPageBottom { page_id } => unit(engine.reach_page_bottom(*page_id)),
            EngineCall::ExecuteVoidScript { script, name } => {
                unit(engine.execute_void_script(script, name))
            }
            EngineCall::ExecuteVoidFunction { name, args } => {
                unit(engine.execute_void_function(name, args))
            }
            EngineCall::ExecuteObjectScriptAndStringify { script } => engine
                .execute_object_script_and_stringify(script)
                .map(Value::String),
            EngineCall::UpdateLocale { locale, resources } => {
                unit(engine.update_locale(locale, resources))
            }
            EngineCall::ConfigurationChanged { page_id, kind } => {
                unit(engine.notify_configuration_changed(*page_id, *kind))
            }
            EngineCall::RegisterBundleChunks { content } => {
                unit(engine.register_bundle_chunks(content))
            }
            EngineCall::RegisterComponents { components } => {
                unit(engine.register_components(components))
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Host calls
// ─────────────────────────────────────────────────────────────────────────────

/// One callback from an engine into its host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HostCall {
    ResolveViewId {
        element_ref: i32,
    },
    ReadDebugAsset {
        path: String,
    },
    KeyEventHandled {
        consumed: bool,
        hash: i32,
    },
    InvokeFeature(FeatureRequest),
    RouterBack,
    RouterPush {
        uri: String,
        params: Value,
    },
    RouterReplace {
        uri: String,
        params: Value,
    },
    RouterClear,
    ProfilerIsEnabled,
    ProfilerRecord {
        message: String,
        thread_id: i64,
    },
    ProfilerTimeStart {
        key: String,
    },
    ProfilerTimeEnd {
        key: String,
    },
    ProfilerSaveData {
        data: String,
    },
    InspectorResponse {
        session_id: i32,
        call_id: i32,
        message: String,
    },
    InspectorNotify {
        session_id: i32,
        message: String,
    },
    InspectorRunMessageLoopOnPause {
        context_group_id: i32,
    },
    InspectorQuitMessageLoopOnPause,
    ScriptError(ScriptError),
    RenderActions {
        page_id: PageId,
        actions: String,
    },
}

impl HostCall {
    pub fn opcode(&self) -> Opcode {
        match self {
            HostCall::ResolveViewId { .. } => Opcode::ResolveViewId,
            HostCall::ReadDebugAsset { .. } => Opcode::ReadDebugAsset,
            HostCall::KeyEventHandled { .. } => Opcode::KeyEventHandled,
            HostCall::InvokeFeature(_) => Opcode::InvokeFeature,
            HostCall::RouterBack => Opcode::RouterBack,
            HostCall::RouterPush { .. } => Opcode::RouterPush,
            HostCall::RouterReplace { .. } => Opcode::RouterReplace,
            HostCall::RouterClear => Opcode::RouterClear,
            HostCall::ProfilerIsEnabled => Opcode::ProfilerIsEnabled,
            HostCall::ProfilerRecord { .. } => Opcode::ProfilerRecord,
            HostCall::ProfilerTimeStart { .. } => Opcode::ProfilerTimeStart,
            HostCall::ProfilerTimeEnd { .. } => Opcode::ProfilerTimeEnd,
            HostCall::ProfilerSaveData { .. } => Opcode::ProfilerSaveData,
            HostCall::InspectorResponse { .. } => Opcode::InspectorResponse,
            HostCall::InspectorNotify { .. } => Opcode::InspectorNotify,
            HostCall::InspectorRunMessageLoopOnPause { .. } => {
                Opcode::InspectorRunMessageLoopOnPause
            }
            HostCall::InspectorQuitMessageLoopOnPause => Opcode::InspectorQuitMessageLoopOnPause,
            HostCall::ScriptError(_) => Opcode::ScriptError,
            HostCall::RenderActions { .. } => Opcode::RenderActions,
        }
    }

    pub fn expects_reply(&self) -> bool {
        matches!(
            self,
            HostCall::ResolveViewId { .. }
                | HostCall::ReadDebugAsset { .. }
                | HostCall::InvokeFeature(_)
                | HostCall::ProfilerIsEnabled
        )
    }

    /// Run this callback against `host`. Callbacks without a result yield
    /// `Null`.
    pub fn dispatch(self, host: &dyn HostCallbacks) -> Value {
        match self {
            HostCall::ResolveViewId { element_ref } => {
                Value::from(host.resolve_view_id(element_ref))
            }
            HostCall::ReadDebugAsset { path } => host
                .read_debug_asset(&path)
                .map(Value::String)
                .unwrap_or(Value::Null),
            HostCall::KeyEventHandled { consumed, hash } => {
                host.on_key_event_handled(consumed, hash);
                Value::Null
            }
            HostCall::InvokeFeature(request) => {
                let response = host.invoke_feature(request);
                serde_json::to_value(response).unwrap_or(Value::Null)
            }
            HostCall::RouterBack => {
                host.router_back();
                Value::Null
            }
            HostCall::RouterPush { uri, params } => {
                host.router_push(&uri, &params);
                Value::Null
            }
            HostCall::RouterReplace { uri, params } => {
                host.router_replace(&uri, &params);
                Value::Null
            }
            HostCall::RouterClear => {
                host.router_clear();
                Value::Null
            }
            HostCall::ProfilerIsEnabled => Value::Bool(host.profiler_is_enabled()),
            HostCall::ProfilerRecord { message, thread_id } => {
                host.profiler_record(&message, thread_id);
                Value::Null
            }
            HostCall::ProfilerTimeStart { key } => {
                host.profiler_time_start(&key);
                Value::Null
            }
            HostCall::ProfilerTimeEnd { key } => {
                host.profiler_time_end(&key);
                Value::Null
            }
            HostCall::ProfilerSaveData { data } => {
                host.profiler_save_data(&data);
                Value::Null
            }
            HostCall::InspectorResponse {
                session_id,
                call_id,
                message,
            } => {
                host.inspector_response(session_id, call_id, &message);
                Value::Null
            }
            HostCall::InspectorNotify {
                session_id,
                message,
            } => {
                host.inspector_notify(session_id, &message);
                Value::Null
            }
            HostCall::InspectorRunMessageLoopOnPause { context_group_id } => {
                host.inspector_run_message_loop_on_pause(context_group_id);
                Value::Null
            }
            HostCall::InspectorQuitMessageLoopOnPause => {
                host.inspector_quit_message_loop_on_pause();
                Value::Null
            }
            HostCall::ScriptError(error) => {
                host.on_script_error(&error);
                Value::Null
            }
            HostCall::RenderActions { page_id, actions } => {
                host.render_actions(page_id, &actions);
                Value::Null
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_from_u32() {
        assert_eq!(Opcode::try_from(16).unwrap(), Opcode::BackPress);
        assert_eq!(Opcode::try_from(119).unwrap(), Opcode::RenderActions);
        assert!(Opcode::try_from(9999).is_err());
    }

    #[test]
    fn test_app_scoped_tagging() {
        assert!(EngineCall::FireEvent { events: vec![] }.is_app_scoped());
        assert!(EngineCall::DestroyApplication { app_id: 1 }.is_app_scoped());
        assert!(
            EngineCall::OrientationChange {
                page_id: 1,
                orientation: Orientation::Landscape
            }
            .is_app_scoped()
        );
        assert!(
            !EngineCall::ExecuteVoidScript {
                script: String::new(),
                name: String::new()
            }
            .is_app_scoped()
        );
    }

    #[test]
    fn test_fallback_matches_reply_kind() {
        assert_eq!(EngineCall::BackPress { page_id: 1 }.fallback(), Value::Bool(false));
        assert_eq!(
            EngineCall::ExecuteObjectScriptAndStringify {
                script: "1".into()
            }
            .fallback(),
            Value::String(String::new())
        );
        assert_eq!(EngineCall::RecreatePage { page_id: 1 }.fallback(), Value::Null);
    }

    #[test]
    fn test_host_call_reply_kinds() {
        assert!(HostCall::ProfilerIsEnabled.expects_reply());
        assert!(!HostCall::RouterBack.expects_reply());
        assert_eq!(
            HostCall::ScriptError(ScriptError::new("x")).opcode(),
            Opcode::ScriptError
        );
    }
}
