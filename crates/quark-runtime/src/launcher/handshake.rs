//! One-round-trip descriptor exchange over the control socket.
//!
//! The app sends the read ends of its forward and backward pipes; the peer
//! answers with the read ends of its own two pipes. Each side then owns one
//! read and one write end per channel.

use std::io::{IoSlice, IoSliceMut};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

use filedescriptor::{FileDescriptor, Pipe};
use nix::sys::socket::{ControlMessage, ControlMessageOwned, MsgFlags, recvmsg, sendmsg};
use tracing::debug;

use crate::channel::ChannelDescriptors;
use crate::error::LaunchError;

/// Descriptors passed in each direction.
const FD_COUNT: usize = 2;

/// Both channel ends held by one side after the handshake.
#[derive(Debug)]
pub struct HandshakeResult {
    /// The channel this side calls on.
    pub positive: ChannelDescriptors,
    /// The channel this side serves.
    pub passive: ChannelDescriptors,
}

fn send_fds(control: &FileDescriptor, fds: &[RawFd]) -> Result<(), LaunchError> {
    // At least one data byte has to accompany the rights.
    let marker = [0u8; 1];
    let iov = [IoSlice::new(&marker)];
    let cmsgs = [ControlMessage::ScmRights(fds)];
    sendmsg::<()>(control.as_raw_fd(), &iov, &cmsgs, MsgFlags::MSG_NOSIGNAL, None)
        .map_err(|e| LaunchError::Handshake(format!("sendmsg failed: {}", e)))?;
    Ok(())
}

fn recv_fds(control: &FileDescriptor) -> Result<Vec<FileDescriptor>, LaunchError> {
    let mut marker = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut marker)];
    let mut space = nix::cmsg_space!([RawFd; FD_COUNT]);

    let msg = recvmsg::<()>(
        control.as_raw_fd(),
        &mut iov,
        Some(&mut space),
        MsgFlags::MSG_CMSG_CLOEXEC,
    )
    .map_err(|e| LaunchError::Handshake(format!("recvmsg failed: {}", e)))?;

    if msg.bytes == 0 {
        return Err(LaunchError::Handshake(
            "control socket closed during handshake".into(),
        ));
    }

    let mut received = Vec::with_capacity(FD_COUNT);
    let cmsgs = msg
        .cmsgs()
        .map_err(|e| LaunchError::Handshake(format!("bad control message: {}", e)))?;
    for cmsg in cmsgs {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            for fd in fds {
                // SAFETY: the kernel just installed `fd` in this process for
                // us; nothing else refers to it.
                received.push(unsafe { FileDescriptor::from_raw_fd(fd) });
            }
        }
    }

    if received.len() != FD_COUNT {
        return Err(LaunchError::Handshake(format!(
            "expected {} descriptors, received {}",
            FD_COUNT,
            received.len()
        )));
    }
    Ok(received)
}

fn take_pair(mut fds: Vec<FileDescriptor>) -> Result<(FileDescriptor, FileDescriptor), LaunchError> {
    let second = fds.pop();
    let first = fds.pop();
    match (first, second) {
        (Some(first), Some(second)) => Ok((first, second)),
        _ => Err(LaunchError::Handshake("descriptor pair incomplete".into())),
    }
}

/// App side of the exchange.
pub fn app_handshake(control: &FileDescriptor) -> Result<HandshakeResult, LaunchError> {
    let forward = Pipe::new()?;
    let backward = Pipe::new()?;

    send_fds(
        control,
        &[forward.read.as_raw_fd(), backward.read.as_raw_fd()],
    )?;
    // The peer owns these now.
    drop(forward.read);
    drop(backward.read);

    let (x_read, y_read) = take_pair(recv_fds(control)?)?;
    debug!("[app_handshake] exchanged descriptors");

    Ok(HandshakeResult {
        positive: ChannelDescriptors {
            read: y_read,
            write: forward.write,
        },
        passive: ChannelDescriptors {
            read: x_read,
            write: backward.write,
        },
    })
}

/// Peer side of the exchange.
pub fn peer_handshake(control: &FileDescriptor) -> Result<HandshakeResult, LaunchError> {
    let (forward_read, backward_read) = take_pair(recv_fds(control)?)?;

    let x = Pipe::new()?;
    let y = Pipe::new()?;
    send_fds(control, &[x.read.as_raw_fd(), y.read.as_raw_fd()])?;
    drop(x.read);
    drop(y.read);
    debug!("[peer_handshake] exchanged descriptors");

    Ok(HandshakeResult {
        positive: ChannelDescriptors {
            read: backward_read,
            write: x.write,
        },
        passive: ChannelDescriptors {
            read: forward_read,
            write: y.write,
        },
    })
}
