//! Host callback interface.
//!
//! The engine calls back into the hosting side through this trait. Calls
//! arrive on the engine's loop thread (in-process) or on the channel
//! receiver thread (sandboxed), so implementations must be thread-safe.

use serde_json::Value;

use crate::error::ScriptError;
use crate::lifecycle::PageId;
use crate::types::{FeatureRequest, FeatureResponse};

pub trait HostCallbacks: Send + Sync {
    /// Map a script-side element reference to a platform view id.
    fn resolve_view_id(&self, element_ref: i32) -> i32;

    /// Read a bundled debug asset, if present.
    fn read_debug_asset(&self, path: &str) -> Option<String>;

    fn on_key_event_handled(&self, consumed: bool, hash: i32);

    fn invoke_feature(&self, request: FeatureRequest) -> FeatureResponse;

    fn router_back(&self);

    fn router_push(&self, uri: &str, params: &Value);

    fn router_replace(&self, uri: &str, params: &Value);

    fn router_clear(&self);

    /// Render actions produced by a page.
    fn render_actions(&self, page_id: PageId, actions: &str);

    /// A script fault reached the loop boundary.
    fn on_script_error(&self, error: &ScriptError);

    // ── profiler ──────────────────────────────────────────────

    fn profiler_is_enabled(&self) -> bool {
        false
    }

    fn profiler_record(&self, _message: &str, _thread_id: i64) {}

    fn profiler_time_start(&self, _key: &str) {}

    fn profiler_time_end(&self, _key: &str) {}

    fn profiler_save_data(&self, _data: &str) {}

    // ── inspector ─────────────────────────────────────────────

    fn inspector_response(&self, _session_id: i32, _call_id: i32, _message: &str) {}

    fn inspector_notify(&self, _session_id: i32, _message: &str) {}

    fn inspector_run_message_loop_on_pause(&self, _context_group_id: i32) {}

    fn inspector_quit_message_loop_on_pause(&self) {}
}
