//! Framing: `<4-byte tag><payload><\n>`. Binary payload prefixes are skipped before the
//! newline scan (see [`Command::binary_prefix_len`]).

use crate::chunk::ChunkEncodeError;
use crate::protocol::{Command, TAG_LEN};

pub const FRAME_TERMINATOR: u8 = b'\n';
const MAX_FRAME_LEN: usize = 64 * 1024; // 64 KiB

/// One raw frame. The tag is kept as bytes so unknown commands can still be answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: [u8; TAG_LEN],
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn command(&self) -> Option<Command> {
        Command::from_tag(&self.tag)
    }
}

/// Encode a frame: tag + payload + newline.
pub fn encode_frame(command: Command, payload: &[u8]) -> Result<Vec<u8>, FrameEncodeError> {
    let prefix = command.binary_prefix_len().min(payload.len());
    if payload[prefix..].contains(&FRAME_TERMINATOR) {
        return Err(FrameEncodeError::EmbeddedNewline);
    }
    let len = TAG_LEN + payload.len() + 1;
    if len > MAX_FRAME_LEN {
        return Err(FrameEncodeError::TooLarge);
    }
    let mut out = Vec::with_capacity(len);
    out.extend_from_slice(command.tag());
    out.extend_from_slice(payload);
    out.push(FRAME_TERMINATOR);
    Ok(out)
}

/// Error encoding a message into a frame.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameEncodeError {
    #[error("chunk encode error: {0}")]
    Chunk(#[from] ChunkEncodeError),
    #[error("payload contains a newline outside its binary prefix")]
    EmbeddedNewline,
    #[error("frame too large")]
    TooLarge,
}

/// Decode one frame from the front of `bytes`. Returns the frame and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` if not enough bytes (caller should try again after more data).
pub fn decode_frame(bytes: &[u8]) -> Result<(Frame, usize), FrameDecodeError> {
    if bytes.len() < TAG_LEN {
        return Err(FrameDecodeError::NeedMore);
    }
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&bytes[..TAG_LEN]);
    let prefix = Command::from_tag(&tag)
        .map(Command::binary_prefix_len)
        .unwrap_or(0);
    let scan_from = TAG_LEN + prefix;
    let newline = if bytes.len() > scan_from {
        bytes[scan_from..]
            .iter()
            .position(|&b| b == FRAME_TERMINATOR)
            .map(|i| scan_from + i)
    } else {
        None
    };
    let Some(end) = newline else {
        if bytes.len() >= MAX_FRAME_LEN {
            return Err(FrameDecodeError::TooLarge);
        }
        return Err(FrameDecodeError::NeedMore);
    };
    if end + 1 > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    let frame = Frame {
        tag,
        payload: bytes[TAG_LEN..end].to_vec(),
    };
    Ok((frame, end + 1))
}

/// Error decoding a frame (need more bytes or too large).
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
}
