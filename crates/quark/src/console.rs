//! Console host: prints what the app renders and forwards router requests
//! to the CLI's navigator.

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use quark_runtime::types::{FeatureRequest, FeatureResponse};
use quark_runtime::{HostCallbacks, PageId, ScriptError};

/// Router requests raised by scripts.
#[derive(Debug, Clone, PartialEq)]
pub enum Navigation {
    Back,
    Push { uri: String, params: Value },
    Replace { uri: String, params: Value },
    Clear,
}

pub struct ConsoleHost {
    navigation: mpsc::UnboundedSender<Navigation>,
}

impl ConsoleHost {
    pub fn new(navigation: mpsc::UnboundedSender<Navigation>) -> Self {
        Self { navigation }
    }

    fn navigate(&self, request: Navigation) {
        if self.navigation.send(request).is_err() {
            debug!("[ConsoleHost] navigator gone, dropping router request");
        }
    }
}

impl HostCallbacks for ConsoleHost {
    fn resolve_view_id(&self, element_ref: i32) -> i32 {
        element_ref
    }

    fn read_debug_asset(&self, path: &str) -> Option<String> {
        debug!("[ConsoleHost] no debug assets ({})", path);
        None
    }

    fn on_key_event_handled(&self, consumed: bool, hash: i32) {
        debug!("[ConsoleHost] key {} consumed={}", hash, consumed);
    }

    fn invoke_feature(&self, request: FeatureRequest) -> FeatureResponse {
        match (request.name.as_str(), request.action.as_str()) {
            ("system.prompt", "showToast") => {
                let message = request.params["message"].as_str().unwrap_or_default();
                println!("[toast] {}", message);
                FeatureResponse::success(Value::Null)
            }
            ("system.device", "getInfo") => FeatureResponse::success(json!({
                "platform": std::env::consts::OS,
                "arch": std::env::consts::ARCH,
                "engine": "quickjs",
            })),
            _ => {
                warn!("[ConsoleHost] feature {}.{} unavailable", request.name, request.action);
                FeatureResponse::no_feature(&request.name)
            }
        }
    }

    fn router_back(&self) {
        self.navigate(Navigation::Back);
    }

    fn router_push(&self, uri: &str, params: &Value) {
        self.navigate(Navigation::Push {
            uri: uri.to_string(),
            params: params.clone(),
        });
    }

    fn router_replace(&self, uri: &str, params: &Value) {
        self.navigate(Navigation::Replace {
            uri: uri.to_string(),
            params: params.clone(),
        });
    }

    fn router_clear(&self) {
        self.navigate(Navigation::Clear);
    }

    fn render_actions(&self, page_id: PageId, actions: &str) {
        println!("[render] page {}: {}", page_id, actions);
    }

    fn on_script_error(&self, error: &ScriptError) {
        match &error.stack {
            Some(stack) => eprintln!("[script error] {}\n{}", error.message, stack),
            None => eprintln!("[script error] {}", error.message),
        }
        error!(target: "quark::script", message = %error.message, "uncaught script error");
    }

    fn profiler_is_enabled(&self) -> bool {
        tracing::enabled!(target: "quark::profiler", tracing::Level::DEBUG)
    }

    fn profiler_record(&self, message: &str, thread_id: i64) {
        debug!(target: "quark::profiler", thread_id, "{}", message);
    }

    fn profiler_time_start(&self, key: &str) {
        debug!(target: "quark::profiler", "time start {}", key);
    }

    fn profiler_time_end(&self, key: &str) {
        debug!(target: "quark::profiler", "time end {}", key);
    }

    fn profiler_save_data(&self, data: &str) {
        info!(target: "quark::profiler", bytes = data.len(), "profiler data saved");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feature(name: &str, action: &str, params: Value) -> FeatureRequest {
        FeatureRequest {
            name: name.into(),
            action: action.into(),
            params,
            callback: String::new(),
            instance_id: 0,
        }
    }

    #[test]
    fn test_router_requests_reach_navigator() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let host = ConsoleHost::new(tx);

        host.router_push("/detail", &json!({ "id": 7 }));
        host.router_back();

        assert_eq!(
            rx.try_recv().unwrap(),
            Navigation::Push {
                uri: "/detail".into(),
                params: json!({ "id": 7 })
            }
        );
        assert_eq!(rx.try_recv().unwrap(), Navigation::Back);
    }

    #[test]
    fn test_known_and_unknown_features() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let host = ConsoleHost::new(tx);

        let info = host.invoke_feature(feature("system.device", "getInfo", Value::Null));
        assert_eq!(info.code, FeatureResponse::SUCCESS);
        assert_eq!(info.content["engine"], "quickjs");

        let missing = host.invoke_feature(feature("system.camera", "take", Value::Null));
        assert_eq!(missing.code, FeatureResponse::NO_FEATURE);
    }
}
