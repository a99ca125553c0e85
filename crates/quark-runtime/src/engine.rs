//! Engine interface.
//!
//! Every method runs on the message loop thread that owns the engine, one
//! at a time. Implementations therefore need no internal locking and need
//! not be `Send`. Out-of-band control (interrupting a running script,
//! releasing a halted peer) goes through [`EngineControl`], which is
//! shareable across threads.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EngineResult;
use crate::lifecycle::{AppId, PageId};
use crate::types::{ConfigurationKind, JsCallback, JsEvent, KeyEvent, Locale, Orientation};

/// Arguments for building a page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageLaunch {
    pub app_id: AppId,
    pub page_id: PageId,
    pub script: String,
    #[serde(default)]
    pub style: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub intent: Value,
    #[serde(default)]
    pub meta: Value,
}

/// Operations the host drives against a script engine.
pub trait Engine {
    /// Load the environment script and bind the app package name.
    fn attach(&mut self, environment_script: &str, package: &str) -> EngineResult<()>;

    fn create_application(
        &mut self,
        app_id: AppId,
        script: &str,
        style: &str,
        meta: &Value,
    ) -> EngineResult<()>;

    fn destroy_application(&mut self, app_id: AppId) -> EngineResult<()>;

    fn request_application(&mut self, app_id: AppId) -> EngineResult<()>;

    fn show_application(&mut self, app_id: AppId) -> EngineResult<()>;

    fn hide_application(&mut self, app_id: AppId) -> EngineResult<()>;

    fn create_page(&mut self, page: &PageLaunch) -> EngineResult<()>;

    fn recreate_page(&mut self, page_id: PageId) -> EngineResult<()>;

    fn refresh_page(&mut self, page_id: PageId, params: &Value, intent: &Value)
    -> EngineResult<()>;

    fn destroy_page(&mut self, page_id: PageId) -> EngineResult<()>;

    fn notify_page_not_found(&mut self, app_id: AppId, uri: &str) -> EngineResult<()>;

    fn change_visible_page(&mut self, page_id: PageId, visible: bool) -> EngineResult<()>;

    fn fire_event(&mut self, events: &[JsEvent]) -> EngineResult<()>;

    /// Returns whether the page consumed the key.
    fn fire_key_event(&mut self, event: &KeyEvent) -> EngineResult<bool>;

    fn fire_callback(&mut self, callback: &JsCallback) -> EngineResult<()>;

    fn back_press(&mut self, page_id: PageId) -> EngineResult<bool>;

    fn menu_press(&mut self, page_id: PageId) -> EngineResult<bool>;

    fn menu_button_press(&mut self, page_id: PageId) -> EngineResult<bool>;

    fn orientation_change(&mut self, page_id: PageId, orientation: Orientation)
    -> EngineResult<()>;

    fn page_scroll(&mut self, page_id: PageId, scroll_top: i32) -> EngineResult<()>;

    fn reach_page_top(&mut self, page_id: PageId) -> EngineResult<()>;

    fn reach_page_bottom(&mut self, page_id: PageId) -> EngineResult<()>;

    fn execute_void_script(&mut self, script: &str, name: &str) -> EngineResult<()>;

    fn execute_void_function(&mut self, name: &str, args: &[Value]) -> EngineResult<()>;

    fn execute_object_script_and_stringify(&mut self, script: &str) -> EngineResult<String>;

    fn update_locale(&mut self, locale: &Locale, resources: &Value) -> EngineResult<()>;

    fn notify_configuration_changed(
        &mut self,
        page_id: PageId,
        kind: ConfigurationKind,
    ) -> EngineResult<()>;

    fn register_bundle_chunks(&mut self, content: &str) -> EngineResult<()>;

    fn register_components(&mut self, components: &Value) -> EngineResult<()>;

    /// Called on the loop thread right before it halts on its block gate.
    fn block(&mut self) -> EngineResult<()> {
        Ok(())
    }

    /// Handle for cross-thread control of this engine.
    fn control(&self) -> Arc<dyn EngineControl>;

    /// Dispose the engine. Called at most once, as the loop stops.
    fn shutdown(&mut self) -> EngineResult<()>;
}

/// Cross-thread control over an engine owned by another thread.
pub trait EngineControl: Send + Sync {
    /// Interrupt the script currently executing. Returns whether a
    /// terminated error will surface from this engine's own calls.
    fn terminate_execution(&self) -> bool;

    /// Clear any interrupt left armed after a terminated execution.
    fn clear_termination(&self) {}

    /// Release an engine that halted on `block`.
    fn unblock(&self) {}
}

/// Control handle for engines that cannot be interrupted.
#[derive(Debug, Default)]
pub struct NoopControl;

impl EngineControl for NoopControl {
    fn terminate_execution(&self) -> bool {
        false
    }
}
