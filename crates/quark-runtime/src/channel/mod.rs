//! Duplex channel over OS pipes.
//!
//! One logical direction uses two one-way pipes: requests flow out on one,
//! responses come back on the other. A process holds a [`ChannelSender`] for
//! the calls it makes and a [`ChannelReceiver`] for the calls it serves.

pub mod codec;
pub mod frame;
mod receiver;
mod sender;

use std::io::{Read, Write};

use filedescriptor::{FileDescriptor, Pipe};

pub use receiver::{ChannelReceiver, Request, RequestHandler, Responder};
pub use sender::{ChannelSender, FailureHandle};

/// The read and write descriptors of one channel end.
#[derive(Debug)]
pub struct ChannelDescriptors {
    pub read: FileDescriptor,
    pub write: FileDescriptor,
}

impl ChannelDescriptors {
    pub fn into_streams(self) -> (Box<dyn Read + Send>, Box<dyn Write + Send>) {
        (Box::new(self.read), Box::new(self.write))
    }
}

/// Two connected channel ends: whatever one writes, the other reads.
pub fn pipe_pair() -> Result<(ChannelDescriptors, ChannelDescriptors), filedescriptor::Error> {
    let a_to_b = Pipe::new()?;
    let b_to_a = Pipe::new()?;
    Ok((
        ChannelDescriptors {
            read: b_to_a.read,
            write: a_to_b.write,
        },
        ChannelDescriptors {
            read: a_to_b.read,
            write: b_to_a.write,
        },
    ))
}
