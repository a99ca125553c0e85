//! Request side of the duplex channel.
//!
//! Writes request frames on the outbound pipe and reads response frames from
//! the inbound pipe on a dedicated reader thread. Outstanding calls live in a
//! correlation table keyed by `call_id`; the reader thread removes and
//! resolves them. When the inbound pipe closes or faults, every outstanding
//! call fails and the disconnect hook fires.

use std::io::{Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::channel::frame::{Frame, POST_ID, read_frame, write_frame};
use crate::error::ChannelError;
use crate::waiter::{Resolver, WaitError, sync_waiter};

type CallResult = Result<Vec<u8>, String>;
type DisconnectHook = Box<dyn FnOnce(String) + Send>;

// ─────────────────────────────────────────────────────────────────────────────
// Correlation table
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct PendingCalls {
    calls: DashMap<u32, Resolver<CallResult>>,
    failed: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl PendingCalls {
    fn register(&self, call_id: u32, resolver: Resolver<CallResult>) -> Result<(), ChannelError> {
        self.calls.insert(call_id, resolver);
        // fail_all may have drained the table between our check and insert
        if self.failed.load(Ordering::SeqCst) {
            if let Some((_, resolver)) = self.calls.remove(&call_id) {
                resolver.fail(self.reason());
            }
            return Err(ChannelError::Disconnected(self.reason()));
        }
        Ok(())
    }

    fn take(&self, call_id: u32) -> Option<Resolver<CallResult>> {
        self.calls.remove(&call_id).map(|(_, resolver)| resolver)
    }

    fn fail_all(&self, reason: &str) -> usize {
        {
            let mut stored = self.reason.lock();
            if stored.is_none() {
                *stored = Some(reason.to_string());
            }
        }
        self.failed.store(true, Ordering::SeqCst);

        let ids: Vec<u32> = self.calls.iter().map(|entry| *entry.key()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some(resolver) = self.take(id) {
                resolver.fail(reason);
                failed += 1;
            }
        }
        failed
    }

    fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    fn reason(&self) -> String {
        self.reason
            .lock()
            .clone()
            .unwrap_or_else(|| "channel failed".to_string())
    }
}

/// Handle that fails every outstanding call on a channel. Held by the
/// launcher's death watch.
#[derive(Clone)]
pub struct FailureHandle {
    pending: Arc<PendingCalls>,
}

impl FailureHandle {
    /// Fail every outstanding call and refuse new ones. Returns how many
    /// calls were failed.
    pub fn fail_all(&self, reason: &str) -> usize {
        self.pending.fail_all(reason)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sender
// ─────────────────────────────────────────────────────────────────────────────

/// Outbound half of a duplex channel: posts and synchronous calls.
pub struct ChannelSender {
    name: String,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    pending: Arc<PendingCalls>,
    next_call_id: AtomicU32,
    call_timeout: Option<Duration>,
    closing: Arc<AtomicBool>,
    on_disconnect: Arc<Mutex<Option<DisconnectHook>>>,
}

impl ChannelSender {
    /// Wire a sender over `reader` (responses in) and `writer` (requests out)
    /// and start its response reader thread.
    pub fn spawn(
        name: impl Into<String>,
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
        call_timeout: Option<Duration>,
    ) -> Result<Arc<Self>, ChannelError> {
        let name = name.into();
        let sender = Arc::new(Self {
            name: name.clone(),
            writer: Mutex::new(Some(writer)),
            pending: Arc::new(PendingCalls::default()),
            next_call_id: AtomicU32::new(1),
            call_timeout,
            closing: Arc::new(AtomicBool::new(false)),
            on_disconnect: Arc::new(Mutex::new(None)),
        });

        let pending = sender.pending.clone();
        let closing = sender.closing.clone();
        let hook = sender.on_disconnect.clone();
        thread::Builder::new()
            .name(format!("{}-responses", name))
            .spawn(move || read_responses(name, reader, pending, closing, hook))?;

        Ok(sender)
    }

    /// Run `hook` once when the peer disconnects or a pipe faults. Not run
    /// after [`close`](Self::close). Runs at once if the channel already
    /// failed.
    pub fn on_disconnect(&self, hook: impl FnOnce(String) + Send + 'static) {
        *self.on_disconnect.lock() = Some(Box::new(hook));
        if self.pending.is_failed() && !self.closing.load(Ordering::SeqCst) {
            let hook = self.on_disconnect.lock().take();
            if let Some(hook) = hook {
                hook(self.pending.reason());
            }
        }
    }

    pub fn failure_handle(&self) -> FailureHandle {
        FailureHandle {
            pending: self.pending.clone(),
        }
    }

    /// Fire-and-forget.
    pub fn post(&self, opcode: u32, payload: Vec<u8>) -> Result<(), ChannelError> {
        if self.pending.is_failed() {
            return Err(ChannelError::Disconnected(self.pending.reason()));
        }
        self.write(&Frame::request(opcode, POST_ID, payload))
    }

    /// Send a request and block until its response arrives, the channel
    /// fails, or the configured deadline passes.
    pub fn call(&self, opcode: u32, payload: Vec<u8>) -> Result<Vec<u8>, ChannelError> {
        let call_id = self.allocate_call_id();
        let (resolver, waiter) = sync_waiter();
        self.pending.register(call_id, resolver)?;

        if let Err(err) = self.write(&Frame::request(opcode, call_id, payload)) {
            self.pending.take(call_id);
            return Err(err);
        }

        match waiter.wait_for(self.call_timeout) {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(remote)) => Err(ChannelError::Remote(remote)),
            Err(WaitError::Timeout(after)) => {
                self.pending.take(call_id);
                warn!("[{}] call {} (opcode {}) timed out after {:?}", self.name, call_id, opcode, after);
                Err(ChannelError::Timeout)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Orderly close: stop writing, fail outstanding calls, and suppress the
    /// disconnect hook.
    pub fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.writer.lock().take();
        let failed = self.pending.fail_all("channel closed");
        debug!("[{}] closed ({} calls failed)", self.name, failed);
    }

    pub fn is_connected(&self) -> bool {
        !self.pending.is_failed()
    }

    pub fn outstanding_calls(&self) -> usize {
        self.pending.calls.len()
    }

    fn allocate_call_id(&self) -> u32 {
        loop {
            let id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
            if id != POST_ID {
                return id;
            }
        }
    }

    fn write(&self, frame: &Frame) -> Result<(), ChannelError> {
        let mut guard = self.writer.lock();
        let Some(writer) = guard.as_mut() else {
            return Err(ChannelError::Disconnected("channel closed".into()));
        };
        match write_frame(writer.as_mut(), frame) {
            Ok(()) => Ok(()),
            Err(err) => {
                // A write fault is treated like peer death.
                guard.take();
                drop(guard);
                let reason = format!("write failed: {}", err);
                error!("[{}] {}", self.name, reason);
                self.pending.fail_all(&reason);
                if !self.closing.load(Ordering::SeqCst) {
                    let hook = self.on_disconnect.lock().take();
                    if let Some(hook) = hook {
                        hook(reason);
                    }
                }
                Err(err)
            }
        }
    }
}

impl Drop for ChannelSender {
    fn drop(&mut self) {
        self.close();
    }
}

fn read_responses(
    name: String,
    mut reader: Box<dyn Read + Send>,
    pending: Arc<PendingCalls>,
    closing: Arc<AtomicBool>,
    hook: Arc<Mutex<Option<DisconnectHook>>>,
) {
    debug!("[{}] response reader started", name);
    let reason = loop {
        match read_frame(reader.as_mut()) {
            Ok(Some(frame)) => match pending.take(frame.call_id) {
                Some(resolver) => {
                    resolver.resolve(frame.into_result());
                }
                None => warn!("[{}] response for unknown call {}", name, frame.call_id),
            },
            Ok(None) => break "peer closed the channel".to_string(),
            Err(err) => break format!("read failed: {}", err),
        }
    };

    let failed = pending.fail_all(&reason);
    if closing.load(Ordering::SeqCst) {
        debug!("[{}] response reader stopped: {}", name, reason);
        return;
    }
    error!("[{}] disconnected: {} ({} calls failed)", name, reason, failed);
    let hook = hook.lock().take();
    if let Some(hook) = hook {
        hook(reason);
    }
}
