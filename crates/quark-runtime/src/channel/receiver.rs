//! Serving side of the duplex channel.
//!
//! A reader thread pulls request frames off the inbound pipe in order and
//! hands each to a [`RequestHandler`]. Calls come with a [`Responder`] that
//! writes the response frame on the outbound pipe; the handler may answer
//! from any thread, so a slow call never holds up later posts.

use std::io::{Read, Write};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::channel::frame::{Frame, read_frame, write_frame};
use crate::error::ChannelError;

type SharedWriter = Arc<Mutex<Option<Box<dyn Write + Send>>>>;

/// A request frame handed to the handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub opcode: u32,
    pub call_id: u32,
    pub payload: Vec<u8>,
}

/// Writes the response for one call. Dropping it unanswered sends an error
/// response so the remote caller is released.
pub struct Responder {
    call_id: u32,
    writer: SharedWriter,
    answered: bool,
}

impl Responder {
    pub fn call_id(&self) -> u32 {
        self.call_id
    }

    pub fn respond(mut self, result: Result<Vec<u8>, String>) {
        self.answered = true;
        self.send(result);
    }

    fn send(&self, result: Result<Vec<u8>, String>) {
        let frame = Frame::response(self.call_id, result);
        let mut guard = self.writer.lock();
        let Some(writer) = guard.as_mut() else {
            debug!("response for call {} dropped: channel closed", self.call_id);
            return;
        };
        if let Err(err) = write_frame(writer.as_mut(), &frame) {
            warn!("failed to write response for call {}: {}", self.call_id, err);
            guard.take();
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if !self.answered {
            self.send(Err("request dropped without a response".into()));
        }
    }
}

/// Receives requests from a channel reader thread.
pub trait RequestHandler: Send + Sync + 'static {
    /// `responder` is `Some` for calls and `None` for posts.
    fn handle(&self, request: Request, responder: Option<Responder>);

    /// The inbound pipe closed or faulted. No further requests follow.
    fn on_closed(&self, _reason: &str) {}
}

/// Inbound half of a duplex channel.
pub struct ChannelReceiver {
    writer: SharedWriter,
}

impl ChannelReceiver {
    /// Start serving requests read from `reader`; responses go to `writer`.
    pub fn spawn(
        name: impl Into<String>,
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Self, ChannelError> {
        let name = name.into();
        let writer: SharedWriter = Arc::new(Mutex::new(Some(writer)));
        let responses = writer.clone();
        thread::Builder::new()
            .name(format!("{}-requests", name))
            .spawn(move || serve(name, reader, responses, handler))?;
        Ok(Self { writer })
    }

    /// Stop answering. The peer sees EOF on its response pipe.
    pub fn close(&self) {
        self.writer.lock().take();
    }
}

impl Drop for ChannelReceiver {
    fn drop(&mut self) {
        self.close();
    }
}

fn serve(
    name: String,
    mut reader: Box<dyn Read + Send>,
    writer: SharedWriter,
    handler: Arc<dyn RequestHandler>,
) {
    debug!("[{}] request reader started", name);
    let reason = loop {
        match read_frame(reader.as_mut()) {
            Ok(Some(frame)) => {
                let responder = (!frame.is_post()).then(|| Responder {
                    call_id: frame.call_id,
                    writer: writer.clone(),
                    answered: false,
                });
                handler.handle(
                    Request {
                        opcode: frame.opcode,
                        call_id: frame.call_id,
                        payload: frame.payload,
                    },
                    responder,
                );
            }
            Ok(None) => break "peer closed the channel".to_string(),
            Err(err) => break format!("read failed: {}", err),
        }
    };
    debug!("[{}] request reader stopped: {}", name, reason);
    handler.on_closed(&reason);
}
