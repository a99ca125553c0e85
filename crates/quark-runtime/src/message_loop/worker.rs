//! Loop thread main routine.

use std::rc::Rc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::message_loop::Message;
use crate::message_loop::context::LoopContext;

/// Process messages in arrival order until shutdown or until every sender
/// is gone.
pub(crate) async fn run_loop(
    ctx: Rc<LoopContext>,
    mut mailbox: mpsc::UnboundedReceiver<Message>,
    mut released: watch::Receiver<u64>,
) {
    debug!("[run_loop:{}] started", ctx.name());

    while let Some(message) = mailbox.recv().await {
        match message {
            Message::Engine { call, reply } => {
                let result = ctx.process(&call);
                if let Some(reply) = reply {
                    match result {
                        Ok(value) => reply.resolve(value),
                        Err(err) => reply.fail(err.to_string()),
                    };
                } else if let Err(err) = result {
                    warn!("[run_loop:{}] {:?} failed: {}", ctx.name(), call.opcode(), err);
                }
            }

            Message::Task(task) => task(ctx.as_ref()),

            Message::Block { epoch } => {
                if *released.borrow() >= epoch {
                    debug!("[run_loop:{}] block {} cancelled", ctx.name(), epoch);
                    continue;
                }
                match ctx.with_engine(|engine| engine.block()) {
                    Ok(Err(err)) => warn!("[run_loop:{}] engine block failed: {}", ctx.name(), err),
                    Err(err) => warn!("[run_loop:{}] engine block skipped: {}", ctx.name(), err),
                    Ok(Ok(())) => {}
                }
                info!("[run_loop:{}] blocked", ctx.name());
                if released.wait_for(|r| *r >= epoch).await.is_err() {
                    break;
                }
                info!("[run_loop:{}] unblocked", ctx.name());
            }

            Message::Shutdown => {
                ctx.dispose();
                break;
            }
        }
    }

    // Anything left in the mailbox is dropped, which releases waiting
    // callers with an error.
    mailbox.close();
    ctx.dispose();
    debug!("[run_loop:{}] stopped", ctx.name());
}
