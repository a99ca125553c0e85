use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{Value, json};

use super::*;
use crate::channel::pipe_pair;
use crate::engine::{Engine, EngineControl, PageLaunch};
use crate::error::ScriptError;
use crate::lifecycle::{AppState, PageId};
use crate::message::EngineCall;
use crate::types::{FeatureRequest, FeatureResponse, JsEvent};

#[derive(Default)]
struct Recorder {
    rendered: Mutex<Vec<(PageId, String)>>,
    errors: Mutex<Vec<ScriptError>>,
    /// Engine channel faults seen by the app side.
    faults: Mutex<Vec<String>>,
}

impl HostCallbacks for Recorder {
    fn resolve_view_id(&self, element_ref: i32) -> i32 {
        element_ref * 2
    }
    fn read_debug_asset(&self, _path: &str) -> Option<String> {
        None
    }
    fn on_key_event_handled(&self, _consumed: bool, _hash: i32) {}
    fn invoke_feature(&self, request: FeatureRequest) -> FeatureResponse {
        FeatureResponse::success(json!({ "echo": request.action }))
    }
    fn router_back(&self) {}
    fn router_push(&self, _uri: &str, _params: &Value) {}
    fn router_replace(&self, _uri: &str, _params: &Value) {}
    fn router_clear(&self) {}
    fn render_actions(&self, page_id: PageId, actions: &str) {
        self.rendered.lock().push((page_id, actions.to_string()));
    }
    fn on_script_error(&self, error: &ScriptError) {
        self.errors.lock().push(error.clone());
    }
}

fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(5));
    }
}

struct Pair {
    app: MessageLoop,
    sandbox: SandboxRuntime,
    host: Arc<Recorder>,
}

fn connect() -> Pair {
    let (app_positive, sandbox_passive) = pipe_pair().unwrap();
    let (app_passive, sandbox_positive) = pipe_pair().unwrap();
    let channel = ChannelConfig::default();

    let sandbox = SandboxRuntime::serve(
        sandbox_passive,
        sandbox_positive,
        EngineConfig::default(),
        &channel,
    )
    .unwrap();

    let host = Arc::new(Recorder::default());
    let faults = host.clone();
    let app_host: Arc<dyn HostCallbacks> = host.clone();
    let app = MessageLoop::spawn("app", move || {
        let engine = connect_app(app_positive, app_passive, app_host.clone(), &channel)?;
        engine.on_disconnect(move |reason| faults.faults.lock().push(reason));
        let engine: Box<dyn Engine> = Box::new(engine);
        Ok((engine, app_host))
    })
    .unwrap();

    Pair { app, sandbox, host }
}

const PAGE: &str = r#"
module.exports = {
  data: { n: 0 },
  render(data) { return { n: data.n, view: quark.getViewId(21) }; },
  handlers: {
    inc() { this.setData({ n: this.data.n + 1 }); },
    fail() { throw new Error('sandboxed failure'); },
  },
  onBackPress() { return this.data.n > 0; },
};
"#;

fn launch(pair: &Pair) {
    pair.app.post(EngineCall::Attach {
        environment_script: String::new(),
        package: "com.example.sandboxed".into(),
    });
    pair.app.post(EngineCall::CreateApplication {
        app_id: 1,
        script: "module.exports = {};".into(),
        style: String::new(),
        meta: Value::Null,
    });
    pair.app.post(EngineCall::CreatePage(PageLaunch {
        app_id: 1,
        page_id: 5,
        script: PAGE.into(),
        style: String::new(),
        params: Value::Null,
        intent: Value::Null,
        meta: Value::Null,
    }));
}

fn shut_down(pair: Pair) {
    pair.app.shutdown(Duration::ZERO);
    pair.app.join().unwrap();
    pair.sandbox.wait().unwrap();
}

#[test]
fn test_page_renders_through_the_channel() {
    let pair = connect();
    launch(&pair);

    wait_until("first render", || !pair.host.rendered.lock().is_empty());
    let (page_id, actions) = pair.host.rendered.lock()[0].clone();
    assert_eq!(page_id, 5);
    let actions: Value = serde_json::from_str(&actions).unwrap();
    assert_eq!(actions["render"], json!({ "n": 0, "view": 42 }));

    shut_down(pair);
}

#[test]
fn test_sync_call_returns_sandbox_result() {
    let pair = connect();
    launch(&pair);

    assert_eq!(
        pair.app.call(EngineCall::BackPress { page_id: 5 }).unwrap(),
        Value::Bool(false)
    );
    pair.app.post(EngineCall::FireEvent {
        events: vec![JsEvent::new(5, 1, "inc")],
    });
    assert_eq!(
        pair.app.call(EngineCall::BackPress { page_id: 5 }).unwrap(),
        Value::Bool(true)
    );
    assert_eq!(
        pair.app
            .call(EngineCall::ExecuteObjectScriptAndStringify {
                script: "[1, 'two']".into()
            })
            .unwrap(),
        json!(r#"[1,"two"]"#)
    );

    shut_down(pair);
}

#[test]
fn test_sandbox_script_error_reaches_app_host() {
    let pair = connect();
    launch(&pair);

    pair.app.post(EngineCall::FireEvent {
        events: vec![JsEvent::new(5, 1, "fail")],
    });
    wait_until("script error", || !pair.host.errors.lock().is_empty());
    assert!(pair.host.errors.lock()[0].message.contains("sandboxed failure"));

    shut_down(pair);
}

#[test]
fn test_block_holds_both_loops_until_unblock() {
    let pair = connect();
    launch(&pair);
    wait_until("first render", || pair.host.rendered.lock().len() == 1);

    pair.app.block(Duration::ZERO);
    pair.app.post(EngineCall::FireEvent {
        events: vec![JsEvent::new(5, 1, "inc")],
    });
    wait_until("sandbox blocked", || pair.sandbox.message_loop().is_blocked());
    thread::sleep(Duration::from_millis(50));
    assert_eq!(pair.host.rendered.lock().len(), 1);

    pair.app.unblock();
    wait_until("render after unblock", || pair.host.rendered.lock().len() == 2);
    assert!(!pair.sandbox.message_loop().is_blocked());

    shut_down(pair);
}

#[test]
fn test_app_shutdown_stops_sandbox() {
    let pair = connect();
    launch(&pair);
    wait_until("first render", || !pair.host.rendered.lock().is_empty());

    let sandbox_loop = pair.sandbox.message_loop().clone();
    shut_down(pair);
    assert_eq!(sandbox_loop.app_state(), AppState::Destroyed);
}

#[test]
fn test_dispatcher_rejects_unknown_opcode() {
    let (app_end, sandbox_end) = pipe_pair().unwrap();
    let (read, write) = app_end.into_streams();
    let sender = ChannelSender::spawn("unknown-opcode", read, write, None).unwrap();

    let message_loop = MessageLoop::spawn(
        "unknown-opcode",
        QuickJsEngine::factory(EngineConfig::default(), Arc::new(Recorder::default())),
    )
    .unwrap();
    let (read, write) = sandbox_end.into_streams();
    let _receiver = ChannelReceiver::spawn(
        "unknown-opcode",
        read,
        write,
        Arc::new(SandboxDispatcher::new(message_loop.clone())),
    )
    .unwrap();

    assert!(matches!(
        sender.call(999, Vec::new()),
        Err(ChannelError::Remote(reason)) if reason.contains("999")
    ));
    assert!(matches!(
        sender.call(crate::message::Opcode::BackPress as u32, vec![0xc1]),
        Err(ChannelError::Remote(_))
    ));
    message_loop.shutdown(Duration::ZERO);
    message_loop.join().unwrap();
}

#[test]
fn test_lost_sandbox_reaches_disconnect_hook() {
    let (app_positive, sandbox_passive) = pipe_pair().unwrap();
    let (app_passive, sandbox_positive) = pipe_pair().unwrap();
    let host: Arc<dyn HostCallbacks> = Arc::new(Recorder::default());
    let engine = connect_app(app_positive, app_passive, host, &ChannelConfig::default()).unwrap();
    let (tx, rx) = std::sync::mpsc::channel();
    engine.on_disconnect(move |reason| {
        let _ = tx.send(reason);
    });

    // Delivered, but the sandbox's own loop owns the interrupt.
    assert!(!engine.control().terminate_execution());

    drop(sandbox_passive);
    drop(sandbox_positive);
    let reason = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(reason, "peer closed the channel");
}

#[test]
fn test_orderly_shutdown_skips_disconnect_hook() {
    let pair = connect();
    launch(&pair);
    wait_until("first render", || !pair.host.rendered.lock().is_empty());

    let host = pair.host.clone();
    shut_down(pair);
    thread::sleep(Duration::from_millis(50));
    assert!(host.faults.lock().is_empty());
}
