//! Request handlers on either end of the sandbox channel.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::channel::{Request, RequestHandler, Responder, codec};
use crate::host::HostCallbacks;
use crate::message::{EngineCall, HostCall, Opcode};
use crate::message_loop::MessageLoop;

fn respond_value(responder: Responder, value: &Value) {
    responder.respond(codec::encode(value).map_err(|e| e.to_string()));
}

// ─────────────────────────────────────────────────────────────────────────────
// App side: host callbacks from the sandbox
// ─────────────────────────────────────────────────────────────────────────────

/// Serves [`HostCall`]s from the sandbox against the app's host. Callbacks
/// run on the channel's reader thread.
pub struct HostDispatcher {
    host: Arc<dyn HostCallbacks>,
}

impl HostDispatcher {
    pub fn new(host: Arc<dyn HostCallbacks>) -> Self {
        Self { host }
    }
}

impl RequestHandler for HostDispatcher {
    fn handle(&self, request: Request, responder: Option<Responder>) {
        let call: HostCall = match codec::decode(&request.payload) {
            Ok(call) => call,
            Err(err) => {
                warn!("[HostDispatcher] undecodable opcode {}: {}", request.opcode, err);
                if let Some(responder) = responder {
                    responder.respond(Err(err.to_string()));
                }
                return;
            }
        };

        let value = call.dispatch(self.host.as_ref());
        if let Some(responder) = responder {
            respond_value(responder, &value);
        }
    }

    fn on_closed(&self, reason: &str) {
        debug!("[HostDispatcher] sandbox stopped calling: {}", reason);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sandbox side: engine operations from the app
// ─────────────────────────────────────────────────────────────────────────────

/// Serves engine operations from the app against the sandbox's loop.
/// Control opcodes act immediately; everything else goes through the
/// loop's mailbox so the reader thread never waits on the engine.
pub struct SandboxDispatcher {
    message_loop: MessageLoop,
}

impl SandboxDispatcher {
    pub fn new(message_loop: MessageLoop) -> Self {
        Self { message_loop }
    }

    fn control(&self, opcode: Opcode) {
        match opcode {
            Opcode::Block => self.message_loop.block(Duration::ZERO),
            Opcode::Unblock => self.message_loop.unblock(),
            Opcode::TerminateExecution => self.message_loop.terminate_execution(),
            Opcode::Shutdown => {
                info!("[SandboxDispatcher] shutdown requested by app");
                self.message_loop.shutdown(Duration::ZERO);
            }
            other => warn!("[SandboxDispatcher] {:?} is not a control opcode", other),
        }
    }
}

impl RequestHandler for SandboxDispatcher {
    fn handle(&self, request: Request, responder: Option<Responder>) {
        let opcode = match Opcode::try_from(request.opcode) {
            Ok(opcode) => opcode,
            Err(err) => {
                warn!("[SandboxDispatcher] {}", err);
                if let Some(responder) = responder {
                    responder.respond(Err(err.to_string()));
                }
                return;
            }
        };

        if opcode.is_control() {
            self.control(opcode);
            return;
        }

        let call: EngineCall = match codec::decode(&request.payload) {
            Ok(call) => call,
            Err(err) => {
                warn!("[SandboxDispatcher] undecodable {:?}: {}", opcode, err);
                if let Some(responder) = responder {
                    responder.respond(Err(err.to_string()));
                }
                return;
            }
        };

        let Some(responder) = responder else {
            self.message_loop.post(call);
            return;
        };

        if !self.message_loop.admits(&call) {
            respond_value(responder, &call.fallback());
            return;
        }
        // A refused task drops the responder, which answers with an error.
        self.message_loop.post_task(move |ctx| {
            let value = ctx.process(&call).unwrap_or_else(|err| {
                debug!("[SandboxDispatcher] {:?} failed: {}", call.opcode(), err);
                call.fallback()
            });
            respond_value(responder, &value);
        });
    }

    fn on_closed(&self, reason: &str) {
        info!("[SandboxDispatcher] app channel closed ({}), shutting down", reason);
        self.message_loop.shutdown(Duration::ZERO);
    }
}
