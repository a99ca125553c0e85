//! End-to-end application lifecycle on the in-process backend, driven only
//! through the public API.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{Value, json};

use quark_runtime::types::{FeatureRequest, FeatureResponse, JsCallback, JsEvent, Locale};
use quark_runtime::{
    AppRuntime, AppState, HostCallbacks, PageId, PageLaunch, PageState, QuarkConfig, ScriptError,
};

#[derive(Default)]
struct Host {
    rendered: Mutex<Vec<(PageId, Value)>>,
    errors: Mutex<Vec<ScriptError>>,
    features: Mutex<Vec<FeatureRequest>>,
    pushes: Mutex<Vec<String>>,
}

impl Host {
    fn last_render(&self) -> Value {
        self.rendered
            .lock()
            .last()
            .map(|(_, actions)| actions["render"].clone())
            .unwrap_or(Value::Null)
    }
}

impl HostCallbacks for Host {
    fn resolve_view_id(&self, element_ref: i32) -> i32 {
        element_ref
    }
    fn read_debug_asset(&self, _path: &str) -> Option<String> {
        None
    }
    fn on_key_event_handled(&self, _consumed: bool, _hash: i32) {}
    fn invoke_feature(&self, request: FeatureRequest) -> FeatureResponse {
        self.features.lock().push(request);
        FeatureResponse::success(Value::Null)
    }
    fn router_back(&self) {}
    fn router_push(&self, uri: &str, _params: &Value) {
        self.pushes.lock().push(uri.to_string());
    }
    fn router_replace(&self, _uri: &str, _params: &Value) {}
    fn router_clear(&self) {}
    fn render_actions(&self, page_id: PageId, actions: &str) {
        let actions = serde_json::from_str(actions).unwrap_or(Value::Null);
        self.rendered.lock().push((page_id, actions));
    }
    fn on_script_error(&self, error: &ScriptError) {
        self.errors.lock().push(error.clone());
    }
}

const APP: &str = r#"
module.exports = {
  onCreate() { globalThis.appErrors = []; },
  onError(err) { globalThis.appErrors.push(err.message); },
};
"#;

const PAGE: &str = r#"
module.exports = {
  data: { status: 'idle', greeting: '' },
  render(data) { return { status: data.status, greeting: data.greeting }; },
  onShow() { this.setData({ greeting: this.$t('hello') }); },
  handlers: {
    fetch() {
      this.$invoke('system.fetch', 'get', { url: 'q' }, (result) => {
        this.setData({ status: 'done:' + result.value });
      });
      this.setData({ status: 'waiting' });
    },
    open() { this.$router.push('/detail', { id: 1 }); },
    broken() { undefined.field; },
    spin() { for (;;) {} },
  },
};
"#;

fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(5));
    }
}

fn launch() -> (AppRuntime, Arc<Host>) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("quark_runtime=debug")
        .with_test_writer()
        .try_init();
    let host = Arc::new(Host::default());
    let app = AppRuntime::in_process(&QuarkConfig::default(), host.clone()).unwrap();
    app.attach("", "com.example.lifecycle");
    app.update_locale(
        Locale {
            language: "en".into(),
            country: String::new(),
        },
        json!({ "hello": "Hello!" }),
    );
    app.create_application(APP, "", Value::Null);
    app.show_application();
    app.create_page(PageLaunch {
        app_id: app.id(),
        page_id: 1,
        script: PAGE.into(),
        style: String::new(),
        params: Value::Null,
        intent: Value::Null,
        meta: Value::Null,
    });
    app.flush().unwrap();
    app.change_visible_page(1, true);
    (app, host)
}

#[test]
fn test_full_lifecycle() {
    let (app, host) = launch();
    wait_until("greeting", || host.last_render()["greeting"] == "Hello!");
    assert_eq!(app.page_state(1), PageState::Visible);

    // Feature with an asynchronous completion.
    app.fire_event(vec![JsEvent::new(1, 0, "fetch")]);
    wait_until("feature request", || !host.features.lock().is_empty());
    let token = host.features.lock()[0].callback.clone();
    assert!(!token.is_empty());
    app.fire_callback(JsCallback {
        callback_id: token,
        data: json!({ "value": 5 }),
    });
    wait_until("callback render", || host.last_render()["status"] == "done:5");

    // Router requests go to the host.
    app.fire_event(vec![JsEvent::new(1, 0, "open")]);
    wait_until("router push", || !host.pushes.lock().is_empty());
    assert_eq!(host.pushes.lock()[0], "/detail");

    // A faulting handler reaches both the host and the app.
    app.fire_event(vec![JsEvent::new(1, 0, "broken")]);
    wait_until("script error", || !host.errors.lock().is_empty());
    app.flush().unwrap();
    assert_eq!(
        app.execute_object_script_and_stringify("globalThis.appErrors.length"),
        "1"
    );

    app.shutdown(Duration::ZERO);
    app.join().unwrap();
    assert_eq!(app.state(), AppState::Destroyed);
    assert_eq!(app.page_state(1), PageState::None);
}

#[test]
fn test_runaway_script_is_terminated_silently() {
    let (app, host) = launch();
    wait_until("first render", || !host.rendered.lock().is_empty());

    app.fire_event(vec![JsEvent::new(1, 0, "spin")]);
    let drained = AtomicBool::new(false);
    thread::scope(|scope| {
        scope.spawn(|| {
            app.flush().unwrap();
            drained.store(true, Ordering::SeqCst);
        });
        while !drained.load(Ordering::SeqCst) {
            app.terminate_execution();
            thread::sleep(Duration::from_millis(20));
        }
    });

    // The loop is usable again.
    assert_eq!(app.execute_object_script_and_stringify("1 + 1"), "2");
    // The interrupt was not reported.
    assert!(host.errors.lock().is_empty());

    app.shutdown(Duration::ZERO);
    app.join().unwrap();
}

#[test]
fn test_blocked_app_resumes_on_shutdown() {
    let (app, host) = launch();
    wait_until("first render", || !host.rendered.lock().is_empty());

    app.block(Duration::ZERO);
    app.fire_event(vec![JsEvent::new(1, 0, "fetch")]);
    thread::sleep(Duration::from_millis(50));
    assert!(host.features.lock().is_empty());

    app.shutdown(Duration::ZERO);
    app.join().unwrap();
    assert_eq!(app.state(), AppState::Destroyed);
}
