//! ChunkPod wire protocol: command tags and typed messages.

use crate::chunk::{ChunkDecodeError, ChunkEncodeError, ChunkRecord, CHUNK_HEADER_LEN};
use crate::identity::{FileId, FileIdError, FILE_ID_HEX_LEN};
use crate::node::{Node, NodeDecodeError, NODE_LEN};
use crate::wire::{encode_frame, Frame, FrameEncodeError};

/// Width of every command tag.
pub const TAG_LEN: usize = 4;

/// RETRY payload: hex file id + 2-byte big-endian order.
pub const RETRY_PAYLOAD_LEN: usize = FILE_ID_HEX_LEN + 2;

/// Closed set of 4-byte opcodes prefixing every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Connect,
    Upload,
    Download,
    Retry,
    Terminate,
    Acknowledge,
    Error,
    Data,
    Peer,
    Disconnect,
    /// Reserved.
    Transfer,
    /// Reserved.
    Initialize,
}

impl Command {
    pub const ALL: [Command; 12] = [
        Command::Connect,
        Command::Upload,
        Command::Download,
        Command::Retry,
        Command::Terminate,
        Command::Acknowledge,
        Command::Error,
        Command::Data,
        Command::Peer,
        Command::Disconnect,
        Command::Transfer,
        Command::Initialize,
    ];

    pub const fn tag(self) -> &'static [u8; TAG_LEN] {
        match self {
            Command::Connect => b"CON:",
            Command::Upload => b"UPL:",
            Command::Download => b"DOW:",
            Command::Retry => b"RET:",
            Command::Terminate => b"TER:",
            Command::Acknowledge => b"ACK:",
            Command::Error => b"ERR:",
            Command::Data => b"DAT:",
            Command::Peer => b"PER:",
            Command::Disconnect => b"DIS:",
            Command::Transfer => b"TRA:",
            Command::Initialize => b"INI:",
        }
    }

    pub fn from_tag(tag: &[u8]) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.tag().as_slice() == tag)
    }

    /// Bytes of raw binary at the start of the payload. These may contain `\n`, so a
    /// frame decoder must skip them before looking for the terminating newline.
    pub const fn binary_prefix_len(self) -> usize {
        match self {
            Command::Connect | Command::Peer => NODE_LEN,
            Command::Upload | Command::Data => CHUNK_HEADER_LEN,
            Command::Retry => RETRY_PAYLOAD_LEN,
            _ => 0,
        }
    }
}

/// Every message type. Each variant maps to exactly one [`Command`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Introduce `node` (the sender's own address) to the receiver.
    Connect { node: Node },
    Upload { chunk: ChunkRecord },
    Download { file_id: FileId },
    Retry { file_id: FileId, order: u16 },
    /// Ends a DATA/PEER response stream.
    Terminate,
    Acknowledge { file_id: FileId },
    Error,
    Data { chunk: ChunkRecord },
    Peer { node: Node },
    Disconnect,
}

impl Message {
    pub fn command(&self) -> Command {
        match self {
            Message::Connect { .. } => Command::Connect,
            Message::Upload { .. } => Command::Upload,
            Message::Download { .. } => Command::Download,
            Message::Retry { .. } => Command::Retry,
            Message::Terminate => Command::Terminate,
            Message::Acknowledge { .. } => Command::Acknowledge,
            Message::Error => Command::Error,
            Message::Data { .. } => Command::Data,
            Message::Peer { .. } => Command::Peer,
            Message::Disconnect => Command::Disconnect,
        }
    }

    fn payload(&self) -> Result<Vec<u8>, ChunkEncodeError> {
        Ok(match self {
            Message::Connect { node } | Message::Peer { node } => node.encode().to_vec(),
            Message::Upload { chunk } | Message::Data { chunk } => chunk.encode()?,
            Message::Download { file_id } | Message::Acknowledge { file_id } => {
                file_id.to_hex().into_bytes()
            }
            Message::Retry { file_id, order } => {
                let mut out = file_id.to_hex().into_bytes();
                out.extend_from_slice(&order.to_be_bytes());
                out
            }
            Message::Terminate | Message::Error | Message::Disconnect => Vec::new(),
        })
    }

    /// Encode into one frame: tag + payload + newline.
    pub fn encode(&self) -> Result<Vec<u8>, FrameEncodeError> {
        let payload = self.payload()?;
        encode_frame(self.command(), &payload)
    }

    /// Interpret a decoded frame.
    pub fn decode(frame: &Frame) -> Result<Self, MessageDecodeError> {
        let command =
            Command::from_tag(&frame.tag).ok_or(MessageDecodeError::UnknownCommand(frame.tag))?;
        let p = frame.payload.as_slice();
        let msg = match command {
            Command::Connect => Message::Connect {
                node: Node::decode(p)?,
            },
            Command::Peer => Message::Peer {
                node: Node::decode(p)?,
            },
            Command::Upload => Message::Upload {
                chunk: ChunkRecord::decode(p)?,
            },
            Command::Data => Message::Data {
                chunk: ChunkRecord::decode(p)?,
            },
            Command::Download => Message::Download {
                file_id: FileId::from_hex(p)?,
            },
            Command::Acknowledge => Message::Acknowledge {
                file_id: FileId::from_hex(p)?,
            },
            Command::Retry => {
                if p.len() != RETRY_PAYLOAD_LEN {
                    return Err(MessageDecodeError::Length {
                        command,
                        expected: RETRY_PAYLOAD_LEN,
                        actual: p.len(),
                    });
                }
                Message::Retry {
                    file_id: FileId::from_hex(&p[..FILE_ID_HEX_LEN])?,
                    order: u16::from_be_bytes([p[FILE_ID_HEX_LEN], p[FILE_ID_HEX_LEN + 1]]),
                }
            }
            Command::Terminate => Message::Terminate,
            Command::Error => Message::Error,
            Command::Disconnect => Message::Disconnect,
            Command::Transfer | Command::Initialize => {
                return Err(MessageDecodeError::Reserved(command))
            }
        };
        Ok(msg)
    }
}

/// Frame was well-formed but its payload could not be interpreted.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MessageDecodeError {
    #[error("unknown command tag {0:?}")]
    UnknownCommand([u8; TAG_LEN]),
    #[error("reserved command {0:?}")]
    Reserved(Command),
    #[error("{command:?} payload must be {expected} bytes, got {actual}")]
    Length {
        command: Command,
        expected: usize,
        actual: usize,
    },
    #[error("bad node: {0}")]
    Node(#[from] NodeDecodeError),
    #[error("bad chunk: {0}")]
    Chunk(#[from] ChunkDecodeError),
    #[error("bad file id: {0}")]
    FileId(#[from] FileIdError),
}
