//! Frame codec for the mailbox transport.
//!
//! Every connection carries exactly one frame: a u32 big-endian length
//! header followed by a JSON body. A zero-length frame is the mailbox poll;
//! the server answers a poll with one stored frame, or with a bare
//! zero-length header when the mailbox is empty.

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};
use shroud_core::WireMsg;

pub const HEADER_LEN: usize = 4;
/// Zero-length frame: "hand me my next message".
pub const POLL: [u8; HEADER_LEN] = [0u8; HEADER_LEN];
/// Upper bound on a frame body; anything larger is treated as garbage.
pub const MAX_FRAME_LEN: usize = 1 << 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientFrame {
    /// Deposit a protocol message in the mailbox this connection targets.
    Post { sender: String, payload: WireMsg },
    /// The sender has finished its part of the run.
    Bye { sender: String },
}

pub fn encode(frame: &ClientFrame) -> io::Result<Vec<u8>> {
    let body = serde_json::to_vec(frame).map_err(io::Error::other)?;
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

pub fn decode(body: &[u8]) -> io::Result<ClientFrame> {
    serde_json::from_slice(body).map_err(io::Error::other)
}

pub fn write_frame<W: Write>(writer: &mut W, frame: &ClientFrame) -> io::Result<()> {
    writer.write_all(&encode(frame)?)
}

pub fn write_poll<W: Write>(writer: &mut W) -> io::Result<()> {
    writer.write_all(&POLL)
}

/// Read one length-prefixed body; `None` for the empty frame.
pub fn read_body<R: Read>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header)?;
    let len = u32::from_be_bytes(header) as usize;
    if len == 0 {
        return Ok(None);
    }
    if len > MAX_FRAME_LEN {
        return Err(io::Error::other(format!("oversized frame: {len} bytes")));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(Some(body))
}
