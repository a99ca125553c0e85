//! Wire framing for the duplex channel.
//!
//! Format: `[opcode: u32 BE][call_id: u32 BE][len: u32 BE][payload: len bytes]`
//!
//! Requests use `call_id == 0` for posts and a fresh non-zero id for calls.
//! Responses reuse the header: `opcode` carries the status and `call_id`
//! echoes the request.

use std::io::{self, Read, Write};

use crate::error::ChannelError;

pub const HEADER_LEN: usize = 12;
pub const MAX_PAYLOAD: usize = 64 * 1024 * 1024;

/// `call_id` of a fire-and-forget request.
pub const POST_ID: u32 = 0;

pub const STATUS_OK: u32 = 0;
pub const STATUS_ERR: u32 = 1;

/// A frame read from or written to a pipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: u32,
    pub call_id: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn request(opcode: u32, call_id: u32, payload: Vec<u8>) -> Self {
        Self {
            opcode,
            call_id,
            payload,
        }
    }

    pub fn response(call_id: u32, result: Result<Vec<u8>, String>) -> Self {
        match result {
            Ok(payload) => Self {
                opcode: STATUS_OK,
                call_id,
                payload,
            },
            Err(message) => Self {
                opcode: STATUS_ERR,
                call_id,
                payload: message.into_bytes(),
            },
        }
    }

    pub fn is_post(&self) -> bool {
        self.call_id == POST_ID
    }

    /// Interpret this frame as a response.
    pub fn into_result(self) -> Result<Vec<u8>, String> {
        match self.opcode {
            STATUS_OK => Ok(self.payload),
            _ => Err(String::from_utf8_lossy(&self.payload).into_owned()),
        }
    }
}

/// Write one frame and flush.
pub fn write_frame<W: Write + ?Sized>(writer: &mut W, frame: &Frame) -> Result<(), ChannelError> {
    if frame.payload.len() > MAX_PAYLOAD {
        return Err(ChannelError::Protocol(format!(
            "payload of {} bytes exceeds limit",
            frame.payload.len()
        )));
    }
    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(&frame.opcode.to_be_bytes());
    header[4..8].copy_from_slice(&frame.call_id.to_be_bytes());
    header[8..12].copy_from_slice(&(frame.payload.len() as u32).to_be_bytes());
    writer.write_all(&header)?;
    writer.write_all(&frame.payload)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame. Returns `Ok(None)` on a clean EOF at a frame boundary.
pub fn read_frame<R: Read + ?Sized>(reader: &mut R) -> Result<Option<Frame>, ChannelError> {
    let mut header = [0u8; HEADER_LEN];
    match read_full(reader, &mut header)? {
        0 => return Ok(None),
        HEADER_LEN => {}
        n => {
            return Err(ChannelError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("truncated frame header ({} bytes)", n),
            )));
        }
    }

    let opcode = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let call_id = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    let len = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
    if len > MAX_PAYLOAD {
        return Err(ChannelError::Protocol(format!(
            "frame length {} exceeds limit",
            len
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(Some(Frame {
        opcode,
        call_id,
        payload,
    }))
}

/// Fill `buf` unless EOF comes first; returns the number of bytes read.
fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_header_layout() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Frame::request(16, 7, vec![0xAA, 0xBB])).unwrap();
        assert_eq!(
            buf,
            vec![0, 0, 0, 16, 0, 0, 0, 7, 0, 0, 0, 2, 0xAA, 0xBB]
        );
    }

    #[test]
    fn test_frames_read_in_write_order() {
        let mut buf = Vec::new();
        for i in 1..=3u32 {
            write_frame(&mut buf, &Frame::request(i, POST_ID, vec![i as u8; i as usize])).unwrap();
        }
        let mut cursor = Cursor::new(buf);
        for i in 1..=3u32 {
            let frame = read_frame(&mut cursor).unwrap().unwrap();
            assert_eq!(frame.opcode, i);
            assert!(frame.is_post());
            assert_eq!(frame.payload.len(), i as usize);
        }
        assert!(read_frame(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn test_truncated_header_is_error() {
        let mut cursor = Cursor::new(vec![0u8, 0, 0, 1, 0]);
        assert!(read_frame(&mut cursor).is_err());
    }

    #[test]
    fn test_truncated_payload_is_error() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Frame::request(1, 0, vec![1, 2, 3, 4])).unwrap();
        buf.truncate(buf.len() - 2);
        assert!(read_frame(&mut Cursor::new(buf)).is_err());
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut header = vec![0u8; HEADER_LEN];
        header[8..12].copy_from_slice(&u32::MAX.to_be_bytes());
        let err = read_frame(&mut Cursor::new(header)).unwrap_err();
        assert!(matches!(err, ChannelError::Protocol(_)));
    }

    #[test]
    fn test_error_response() {
        let frame = Frame::response(9, Err("boom".into()));
        assert_eq!(frame.opcode, STATUS_ERR);
        assert_eq!(frame.into_result(), Err("boom".to_string()));
    }
}
