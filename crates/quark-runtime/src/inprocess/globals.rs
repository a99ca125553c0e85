//! Script Global Objects
//!
//! Registers the `quark` global, which forwards script calls to the host,
//! and a `console` that writes to tracing.

use std::sync::Arc;

use rquickjs::convert::Coerced;
use rquickjs::function::{Opt, Rest};
use rquickjs::{Ctx, Function, Object, Result as JsResult};
use serde_json::Value;

use crate::host::HostCallbacks;
use crate::types::{FeatureRequest, FeatureResponse};

const SCRIPT_TARGET: &str = "quark::script";

/// Register the `quark` global object and all its methods.
pub fn register_quark_globals(ctx: &Ctx<'_>, host: Arc<dyn HostCallbacks>) -> JsResult<()> {
    let globals = ctx.globals();

    register_console(ctx)?;

    let quark = Object::new(ctx.clone())?;

    let h = host.clone();
    quark.set(
        "callNative",
        Function::new(ctx.clone(), move |page_id: i32, actions: String| {
            h.render_actions(page_id, &actions);
        })?,
    )?;

    let h = host.clone();
    quark.set(
        "getViewId",
        Function::new(ctx.clone(), move |element_ref: i32| h.resolve_view_id(element_ref))?,
    )?;

    let h = host.clone();
    quark.set(
        "readDebugAsset",
        Function::new(ctx.clone(), move |path: String| h.read_debug_asset(&path))?,
    )?;

    let h = host.clone();
    quark.set(
        "keyEventHandled",
        Function::new(ctx.clone(), move |consumed: bool, hash: i32| {
            h.on_key_event_handled(consumed, hash);
        })?,
    )?;

    let h = host.clone();
    quark.set(
        "invoke",
        Function::new(ctx.clone(), move |request: String| invoke_feature(h.as_ref(), &request))?,
    )?;

    quark.set("router", router_object(ctx, &host)?)?;
    quark.set("profiler", profiler_object(ctx, &host)?)?;
    quark.set("inspector", inspector_object(ctx, &host)?)?;

    globals.set("quark", quark)?;

    Ok(())
}

/// Decode a JSON feature request, run it, and encode the response.
fn invoke_feature(host: &dyn HostCallbacks, request: &str) -> String {
    let response = match serde_json::from_str::<FeatureRequest>(request) {
        Ok(request) => host.invoke_feature(request),
        Err(err) => FeatureResponse::error(format!("malformed feature request: {}", err)),
    };
    serde_json::to_string(&response).unwrap_or_default()
}

fn parse_params(params: Opt<String>) -> Value {
    params
        .0
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or(Value::Null)
}

fn router_object<'js>(ctx: &Ctx<'js>, host: &Arc<dyn HostCallbacks>) -> JsResult<Object<'js>> {
    let router = Object::new(ctx.clone())?;

    let h = host.clone();
    router.set("back", Function::new(ctx.clone(), move || h.router_back())?)?;

    let h = host.clone();
    router.set(
        "push",
        Function::new(ctx.clone(), move |uri: String, params: Opt<String>| {
            h.router_push(&uri, &parse_params(params));
        })?,
    )?;

    let h = host.clone();
    router.set(
        "replace",
        Function::new(ctx.clone(), move |uri: String, params: Opt<String>| {
            h.router_replace(&uri, &parse_params(params));
        })?,
    )?;

    let h = host.clone();
    router.set("clear", Function::new(ctx.clone(), move || h.router_clear())?)?;

    Ok(router)
}

fn profiler_object<'js>(ctx: &Ctx<'js>, host: &Arc<dyn HostCallbacks>) -> JsResult<Object<'js>> {
    let profiler = Object::new(ctx.clone())?;

    let h = host.clone();
    profiler.set(
        "isEnabled",
        Function::new(ctx.clone(), move || h.profiler_is_enabled())?,
    )?;

    let h = host.clone();
    profiler.set(
        "record",
        Function::new(ctx.clone(), move |message: String, thread_id: Opt<f64>| {
            h.profiler_record(&message, thread_id.0.unwrap_or_default() as i64);
        })?,
    )?;

    let h = host.clone();
    profiler.set(
        "time",
        Function::new(ctx.clone(), move |key: String| h.profiler_time_start(&key))?,
    )?;

    let h = host.clone();
    profiler.set(
        "timeEnd",
        Function::new(ctx.clone(), move |key: String| h.profiler_time_end(&key))?,
    )?;

    let h = host.clone();
    profiler.set(
        "saveProfilerData",
        Function::new(ctx.clone(), move |data: String| h.profiler_save_data(&data))?,
    )?;

    Ok(profiler)
}

fn inspector_object<'js>(ctx: &Ctx<'js>, host: &Arc<dyn HostCallbacks>) -> JsResult<Object<'js>> {
    let inspector = Object::new(ctx.clone())?;

    let h = host.clone();
    inspector.set(
        "sendResponse",
        Function::new(
            ctx.clone(),
            move |session_id: i32, call_id: i32, message: String| {
                h.inspector_response(session_id, call_id, &message);
            },
        )?,
    )?;

    let h = host.clone();
    inspector.set(
        "sendNotification",
        Function::new(ctx.clone(), move |session_id: i32, message: String| {
            h.inspector_notify(session_id, &message);
        })?,
    )?;

    let h = host.clone();
    inspector.set(
        "runMessageLoopOnPause",
        Function::new(ctx.clone(), move |context_group_id: i32| {
            h.inspector_run_message_loop_on_pause(context_group_id);
        })?,
    )?;

    let h = host.clone();
    inspector.set(
        "quitMessageLoopOnPause",
        Function::new(ctx.clone(), move || h.inspector_quit_message_loop_on_pause())?,
    )?;

    Ok(inspector)
}

fn join(args: Rest<Coerced<String>>) -> String {
    args.0
        .iter()
        .map(|arg| arg.0.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Register the console object with log, info, warn, error and debug.
fn register_console(ctx: &Ctx<'_>) -> JsResult<()> {
    let globals = ctx.globals();

    if globals.get::<_, Object>("console").is_ok() {
        return Ok(());
    }

    let console = Object::new(ctx.clone())?;

    console.set(
        "log",
        Function::new(ctx.clone(), |args: Rest<Coerced<String>>| {
            tracing::info!(target: SCRIPT_TARGET, "{}", join(args));
        })?,
    )?;

    console.set(
        "info",
        Function::new(ctx.clone(), |args: Rest<Coerced<String>>| {
            tracing::info!(target: SCRIPT_TARGET, "{}", join(args));
        })?,
    )?;

    console.set(
        "warn",
        Function::new(ctx.clone(), |args: Rest<Coerced<String>>| {
            tracing::warn!(target: SCRIPT_TARGET, "{}", join(args));
        })?,
    )?;

    console.set(
        "error",
        Function::new(ctx.clone(), |args: Rest<Coerced<String>>| {
            tracing::error!(target: SCRIPT_TARGET, "{}", join(args));
        })?,
    )?;

    console.set(
        "debug",
        Function::new(ctx.clone(), |args: Rest<Coerced<String>>| {
            tracing::debug!(target: SCRIPT_TARGET, "{}", join(args));
        })?,
    )?;

    globals.set("console", console)?;

    Ok(())
}
