use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use proptest::prelude::*;
use serde_json::{Value, json};

use super::*;
use crate::engine::{EngineControl, PageLaunch};
use crate::error::{EngineResult, ScriptError};
use crate::lifecycle::{AppId, PageId};
use crate::types::{
    ConfigurationKind, FeatureRequest, FeatureResponse, JsCallback, JsEvent, KeyEvent, Locale,
    Orientation,
};

// ─────────────────────────────────────────────────────────────────────────────
// Spies
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Record {
    calls: Mutex<Vec<String>>,
    in_call: AtomicBool,
    overlaps: AtomicUsize,
    shutdowns: AtomicUsize,
    threads: Mutex<Vec<thread::ThreadId>>,
}

impl Record {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[derive(Default)]
struct SpyControl {
    armed: AtomicBool,
    /// Hands the interrupt to another process instead of arming locally.
    forwards: bool,
    forwarded: AtomicUsize,
}

impl EngineControl for SpyControl {
    fn terminate_execution(&self) -> bool {
        if self.forwards {
            self.forwarded.fetch_add(1, Ordering::SeqCst);
            return false;
        }
        self.armed.store(true, Ordering::SeqCst);
        true
    }

    fn clear_termination(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }
}

struct SpyEngine {
    record: Arc<Record>,
    control: Arc<SpyControl>,
}

impl SpyEngine {
    fn hit(&mut self, op: impl Into<String>) -> EngineResult<()> {
        if self.record.in_call.swap(true, Ordering::SeqCst) {
            self.record.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        {
            let mut threads = self.record.threads.lock();
            let id = thread::current().id();
            if !threads.contains(&id) {
                threads.push(id);
            }
        }
        let op = op.into();
        self.record.calls.lock().push(op.clone());
        thread::yield_now();
        self.record.in_call.store(false, Ordering::SeqCst);

        if self.control.armed.load(Ordering::SeqCst) && op.starts_with("script:") {
            return Err(ScriptError::new("interrupted").interrupted().into());
        }
        if op.ends_with(":interrupted") {
            return Err(ScriptError::new("interrupted").interrupted().into());
        }
        if op.ends_with(":fail") {
            return Err(ScriptError::new(format!("{} threw", op)).into());
        }
        Ok(())
    }
}

impl Engine for SpyEngine {
    fn attach(&mut self, _environment_script: &str, package: &str) -> EngineResult<()> {
        self.hit(format!("attach:{}", package))
    }
    fn create_application(&mut self, app_id: AppId, _: &str, _: &str, _: &Value) -> EngineResult<()> {
        self.hit(format!("create_app:{}", app_id))
    }
    fn destroy_application(&mut self, app_id: AppId) -> EngineResult<()> {
        self.hit(format!("destroy_app:{}", app_id))
    }
    fn request_application(&mut self, _: AppId) -> EngineResult<()> {
        self.hit("request_app")
    }
    fn show_application(&mut self, _: AppId) -> EngineResult<()> {
        self.hit("show_app")
    }
    fn hide_application(&mut self, _: AppId) -> EngineResult<()> {
        self.hit("hide_app")
    }
    fn create_page(&mut self, page: &PageLaunch) -> EngineResult<()> {
        self.hit(format!("create_page:{}", page.page_id))
    }
    fn recreate_page(&mut self, page_id: PageId) -> EngineResult<()> {
        self.hit(format!("recreate_page:{}", page_id))
    }
    fn refresh_page(&mut self, page_id: PageId, _: &Value, _: &Value) -> EngineResult<()> {
        self.hit(format!("refresh_page:{}", page_id))
    }
    fn destroy_page(&mut self, page_id: PageId) -> EngineResult<()> {
        self.hit(format!("destroy_page:{}", page_id))
    }
    fn notify_page_not_found(&mut self, _: AppId, uri: &str) -> EngineResult<()> {
        self.hit(format!("not_found:{}", uri))
    }
    fn change_visible_page(&mut self, page_id: PageId, visible: bool) -> EngineResult<()> {
        self.hit(format!("visible:{}:{}", page_id, visible))
    }
    fn fire_event(&mut self, events: &[JsEvent]) -> EngineResult<()> {
        let names: Vec<_> = events.iter().map(|e| e.event_type.as_str()).collect();
        self.hit(format!("event:{}", names.join(",")))
    }
    fn fire_key_event(&mut self, event: &KeyEvent) -> EngineResult<bool> {
        self.hit(format!("key:{}", event.code))?;
        Ok(event.code == 4)
    }
    fn fire_callback(&mut self, callback: &JsCallback) -> EngineResult<()> {
        self.hit(format!("callback:{}", callback.callback_id))
    }
    fn back_press(&mut self, page_id: PageId) -> EngineResult<bool> {
        self.hit(format!("back:{}", page_id))?;
        Ok(true)
    }
    fn menu_press(&mut self, page_id: PageId) -> EngineResult<bool> {
        self.hit(format!("menu:{}", page_id))?;
        Ok(false)
    }
    fn menu_button_press(&mut self, page_id: PageId) -> EngineResult<bool> {
        self.hit(format!("menu_button:{}", page_id))?;
        Ok(false)
    }
    fn orientation_change(&mut self, page_id: PageId, o: Orientation) -> EngineResult<()> {
        self.hit(format!("orientation:{}:{}", page_id, o.as_str()))
    }
    fn page_scroll(&mut self, page_id: PageId, top: i32) -> EngineResult<()> {
        self.hit(format!("scroll:{}:{}", page_id, top))
    }
    fn reach_page_top(&mut self, page_id: PageId) -> EngineResult<()> {
        self.hit(format!("top:{}", page_id))
    }
    fn reach_page_bottom(&mut self, page_id: PageId) -> EngineResult<()> {
        self.hit(format!("bottom:{}", page_id))
    }
    fn execute_void_script(&mut self, _script: &str, name: &str) -> EngineResult<()> {
        self.hit(format!("script:{}", name))
    }
    fn execute_void_function(&mut self, name: &str, _args: &[Value]) -> EngineResult<()> {
        self.hit(format!("function:{}", name))
    }
    fn execute_object_script_and_stringify(&mut self, script: &str) -> EngineResult<String> {
        self.hit("stringify")?;
        Ok(format!("\"{}\"", script))
    }
    fn update_locale(&mut self, locale: &Locale, _: &Value) -> EngineResult<()> {
        self.hit(format!("locale:{}", locale.language))
    }
    fn notify_configuration_changed(&mut self, _: PageId, kind: ConfigurationKind) -> EngineResult<()> {
        self.hit(format!("config:{}", kind.as_str()))
    }
    fn register_bundle_chunks(&mut self, _: &str) -> EngineResult<()> {
        self.hit("chunks")
    }
    fn register_components(&mut self, _: &Value) -> EngineResult<()> {
        self.hit("components")
    }
    fn control(&self) -> Arc<dyn EngineControl> {
        self.control.clone()
    }
    fn shutdown(&mut self) -> EngineResult<()> {
        self.record.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct SpyHost {
    errors: Mutex<Vec<ScriptError>>,
}

impl HostCallbacks for SpyHost {
    fn resolve_view_id(&self, element_ref: i32) -> i32 {
        element_ref
    }
    fn read_debug_asset(&self, _path: &str) -> Option<String> {
        None
    }
    fn on_key_event_handled(&self, _consumed: bool, _hash: i32) {}
    fn invoke_feature(&self, request: FeatureRequest) -> FeatureResponse {
        FeatureResponse::no_feature(&request.name)
    }
    fn router_back(&self) {}
    fn router_push(&self, _uri: &str, _params: &Value) {}
    fn router_replace(&self, _uri: &str, _params: &Value) {}
    fn router_clear(&self) {}
    fn render_actions(&self, _page_id: PageId, _actions: &str) {}
    fn on_script_error(&self, error: &ScriptError) {
        self.errors.lock().push(error.clone());
    }
}

struct Fixture {
    lp: MessageLoop,
    record: Arc<Record>,
    host: Arc<SpyHost>,
}

fn spawn_spy() -> Fixture {
    spawn_spy_with(Arc::new(SpyControl::default()))
}

fn spawn_spy_with(control: Arc<SpyControl>) -> Fixture {
    let record = Arc::new(Record::default());
    let host = Arc::new(SpyHost::default());
    let (r, h) = (record.clone(), host.clone());
    let lp = MessageLoop::spawn("spy", move || {
        let engine: Box<dyn Engine> = Box::new(SpyEngine { record: r, control });
        let host: Arc<dyn HostCallbacks> = h;
        Ok((engine, host))
    })
    .unwrap();
    Fixture { lp, record, host }
}

fn script(name: &str) -> EngineCall {
    EngineCall::ExecuteVoidScript {
        script: String::new(),
        name: name.to_string(),
    }
}

fn event(kind: &str) -> EngineCall {
    EngineCall::FireEvent {
        events: vec![JsEvent::new(1, 2, kind)],
    }
}

fn barrier(lp: &MessageLoop) {
    lp.post_and_wait(|_| ()).unwrap();
}

// ─────────────────────────────────────────────────────────────────────────────
// Ordering and confinement
// ─────────────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_posts_observed_in_posted_order(ops in prop::collection::vec(0u8..4, 1..60)) {
        let fx = spawn_spy();
        let mut expected = Vec::new();
        for (i, op) in ops.iter().enumerate() {
            let (call, label) = match op {
                0 => (script(&format!("s{}", i)), format!("script:s{}", i)),
                1 => (EngineCall::PageScroll { page_id: 1, scroll_top: i as i32 }, format!("scroll:1:{}", i)),
                2 => (EngineCall::ReachPageTop { page_id: i as i32 }, format!("top:{}", i)),
                _ => (EngineCall::ExecuteVoidFunction { name: format!("f{}", i), args: vec![] }, format!("function:f{}", i)),
            };
            fx.lp.post(call);
            expected.push(label);
        }
        barrier(&fx.lp);
        prop_assert_eq!(fx.record.calls(), expected);
    }
}

#[test]
fn test_engine_never_entered_concurrently() {
    let fx = spawn_spy();
    let posters: Vec<_> = (0..8)
        .map(|t| {
            let lp = fx.lp.clone();
            thread::spawn(move || {
                for i in 0..100 {
                    lp.post(EngineCall::PageScroll {
                        page_id: t,
                        scroll_top: i,
                    });
                }
            })
        })
        .collect();
    for poster in posters {
        poster.join().unwrap();
    }
    barrier(&fx.lp);

    assert_eq!(fx.record.calls().len(), 800);
    assert_eq!(fx.record.overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(fx.record.threads.lock().len(), 1);

    // Per-origin order holds even when origins interleave.
    for t in 0..8 {
        let prefix = format!("scroll:{}:", t);
        let seen: Vec<i32> = fx
            .record
            .calls()
            .iter()
            .filter_map(|c| c.strip_prefix(&prefix).and_then(|n| n.parse().ok()))
            .collect();
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// post_and_wait
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_post_and_wait_from_other_thread() {
    let fx = spawn_spy();
    let loop_thread = fx.lp.post_and_wait(|_| thread::current().id()).unwrap();
    assert_ne!(loop_thread, thread::current().id());
    assert_eq!(fx.record.threads.lock().len(), 0);
}

#[test]
fn test_post_and_wait_reentrant_on_loop_thread() {
    let fx = spawn_spy();
    let lp = fx.lp.clone();
    let direct = fx.lp.post_and_wait(|ctx| ctx.name().len() * 2).unwrap();
    let nested = fx
        .lp
        .post_and_wait(move |_| {
            assert!(lp.is_loop_thread());
            lp.post_and_wait(|ctx| ctx.name().len() * 2)
        })
        .unwrap()
        .unwrap();
    assert_eq!(direct, nested);
}

#[test]
fn test_call_on_loop_thread_runs_inline() {
    let fx = spawn_spy();
    let lp = fx.lp.clone();
    let handled = fx
        .lp
        .post_and_wait(move |_| lp.call(EngineCall::BackPress { page_id: 5 }))
        .unwrap()
        .unwrap();
    assert_eq!(handled, Value::Bool(true));
    assert_eq!(fx.record.calls(), vec!["back:5"]);
}

#[test]
fn test_panic_in_callable_is_returned_to_caller() {
    let fx = spawn_spy();
    let result: Result<(), _> = fx.lp.post_and_wait(|_| panic!("bad callable"));
    match result {
        Err(LoopError::CallablePanicked(message)) => assert_eq!(message, "bad callable"),
        other => panic!("unexpected: {:?}", other),
    }
    // The loop survived.
    assert_eq!(fx.lp.post_and_wait(|_| 1).unwrap(), 1);
}

#[test]
fn test_nested_engine_access_reports_busy() {
    let fx = spawn_spy();
    let busy = fx
        .lp
        .post_and_wait(|ctx| {
            ctx.with_engine(|_outer| ctx.with_engine(|_inner| ()).is_err())
                .unwrap()
        })
        .unwrap();
    assert!(busy);
}

#[test]
fn test_sync_calls_return_engine_results() {
    let fx = spawn_spy();
    let key = |code| EngineCall::FireKeyEvent {
        event: KeyEvent {
            page_id: 1,
            element_ref: 0,
            code,
            action: 0,
            repeat_count: 0,
            hash: 9,
        },
    };
    assert_eq!(fx.lp.call(key(4)).unwrap(), Value::Bool(true));
    assert_eq!(fx.lp.call(key(5)).unwrap(), Value::Bool(false));
    assert_eq!(
        fx.lp
            .call(EngineCall::ExecuteObjectScriptAndStringify {
                script: "x".into()
            })
            .unwrap(),
        json!("\"x\"")
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Init and shutdown
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_failed_init_never_starts() {
    let result = MessageLoop::spawn("broken", || {
        Err(crate::error::EngineError::Unavailable("no engine".into()))
    });
    match result {
        Err(LoopError::Init(reason)) => assert!(reason.contains("no engine")),
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("loop started without an engine"),
    }
}

#[test]
fn test_runtime_inited_after_spawn() {
    let fx = spawn_spy();
    assert_eq!(fx.lp.app_state(), AppState::RuntimeInited);
}

#[test]
fn test_shutdown_twice_equals_once() {
    let fx = spawn_spy();
    fx.lp.post(script("last"));
    fx.lp.shutdown(Duration::ZERO);
    fx.lp.shutdown(Duration::ZERO);
    fx.lp.join().unwrap();
    fx.lp.join().unwrap();

    assert_eq!(fx.record.shutdowns.load(Ordering::SeqCst), 1);
    assert_eq!(fx.record.calls(), vec!["script:last"]);
    assert_eq!(fx.lp.app_state(), AppState::Destroyed);
    assert!(matches!(fx.lp.post_and_wait(|_| ()), Err(LoopError::Stopped)));
    fx.lp.post(script("after"));
    assert_eq!(fx.record.calls(), vec!["script:last"]);
}

#[test]
fn test_delayed_shutdown() {
    let fx = spawn_spy();
    fx.lp.shutdown(Duration::from_millis(50));
    fx.lp.post(script("before"));
    fx.lp.join().unwrap();
    assert_eq!(fx.record.calls(), vec!["script:before"]);
    assert_eq!(fx.record.shutdowns.load(Ordering::SeqCst), 1);
}

// ─────────────────────────────────────────────────────────────────────────────
// Gating
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_app_scoped_dropped_once_destroyed() {
    let fx = spawn_spy();
    fx.lp.post(EngineCall::CreateApplication {
        app_id: 1,
        script: String::new(),
        style: String::new(),
        meta: Value::Null,
    });

    // Both admitted while running; the event is already queued when the
    // application is destroyed.
    fx.lp.block(Duration::ZERO);
    fx.lp.post(EngineCall::DestroyApplication { app_id: 1 });
    fx.lp.post(event("click"));
    fx.lp.unblock();
    barrier(&fx.lp);
    assert_eq!(fx.lp.app_state(), AppState::Destroyed);

    // Posted after the fact.
    fx.lp.post(event("tap"));
    barrier(&fx.lp);

    assert_eq!(fx.record.calls(), vec!["create_app:1", "destroy_app:1"]);
    // Operations that are not application-scoped still run.
    fx.lp.post(script("diagnostics"));
    barrier(&fx.lp);
    assert_eq!(fx.record.calls().last().unwrap(), "script:diagnostics");
}

#[test]
fn test_admission_refused_while_destroying() {
    let fx = spawn_spy();
    fx.lp.state_cell().set(AppState::Destroying);
    fx.lp.post(event("late"));
    assert_eq!(
        fx.lp.call(EngineCall::BackPress { page_id: 1 }).unwrap(),
        Value::Bool(false)
    );
    // Teardown still gets through.
    fx.lp.post_unchecked(EngineCall::DestroyPage { page_id: 1 });
    barrier(&fx.lp);
    assert_eq!(fx.record.calls(), vec!["destroy_page:1"]);
}

// ─────────────────────────────────────────────────────────────────────────────
// Block / unblock
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_blocked_loop_holds_messages_until_unblock() {
    let fx = spawn_spy();
    fx.lp.block(Duration::ZERO);
    for name in ["a", "b", "c"] {
        fx.lp.post(script(name));
    }
    thread::sleep(Duration::from_millis(50));
    assert!(fx.lp.is_blocked());
    assert!(fx.record.calls().is_empty());

    fx.lp.unblock();
    barrier(&fx.lp);
    assert!(!fx.lp.is_blocked());
    assert_eq!(fx.record.calls(), vec!["script:a", "script:b", "script:c"]);
}

#[test]
fn test_unblock_cancels_pending_delayed_block() {
    let fx = spawn_spy();
    fx.lp.block(Duration::from_millis(40));
    fx.lp.unblock();
    thread::sleep(Duration::from_millis(80));
    fx.lp.post(script("free"));
    barrier(&fx.lp);
    assert_eq!(fx.record.calls(), vec!["script:free"]);
}

#[test]
fn test_shutdown_releases_blocked_loop() {
    let fx = spawn_spy();
    fx.lp.block(Duration::ZERO);
    fx.lp.post(script("queued"));
    fx.lp.shutdown(Duration::ZERO);
    fx.lp.join().unwrap();
    assert_eq!(fx.record.calls(), vec!["script:queued"]);
}

// ─────────────────────────────────────────────────────────────────────────────
// Error policy
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_script_error_reported_to_host_and_app() {
    let fx = spawn_spy();
    fx.lp.post(EngineCall::CreateApplication {
        app_id: 3,
        script: String::new(),
        style: String::new(),
        meta: Value::Null,
    });
    fx.lp.post(script("boot:fail"));
    fx.lp.post(script("next"));
    barrier(&fx.lp);

    let errors = fx.host.errors.lock().clone();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].message, "script:boot:fail threw");
    assert_eq!(
        fx.record.calls(),
        vec![
            "create_app:3",
            "script:boot:fail",
            "function:notifyAppError",
            "script:next"
        ]
    );
}

#[test]
fn test_expected_termination_suppressed_once() {
    let fx = spawn_spy();
    fx.lp.terminate_execution();
    fx.lp.post(script("long"));
    barrier(&fx.lp);
    assert!(fx.host.errors.lock().is_empty());

    // An interruption nobody asked for is reported.
    fx.lp
        .post_and_wait(|ctx| ctx.control().terminate_execution())
        .unwrap();
    fx.lp.post(script("again"));
    barrier(&fx.lp);
    let errors = fx.host.errors.lock().clone();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].terminated);
}

#[test]
fn test_forwarded_termination_leaves_nothing_to_suppress() {
    let control = Arc::new(SpyControl {
        forwards: true,
        ..Default::default()
    });
    let fx = spawn_spy_with(control.clone());
    fx.lp.terminate_execution();
    assert_eq!(control.forwarded.load(Ordering::SeqCst), 1);

    // A later interruption this side never asked for is still reported.
    fx.lp.post(script("later:interrupted"));
    barrier(&fx.lp);
    let errors = fx.host.errors.lock().clone();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].terminated);
}
