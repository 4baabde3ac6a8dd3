//! ChunkPod protocol reference implementation.
//! No I/O: node identity, command framing, chunk records, distribution and reassembly.
//! The daemon crate drives sockets and storage around these types.

pub mod chunk;
pub mod identity;
pub mod integrity;
pub mod node;
pub mod protocol;
pub mod reassembly;
pub mod scheduler;
pub mod wire;

pub use chunk::{split_into_chunks, ChunkRecord, CHUNK_SIZE};
pub use identity::{Checksum, FileId};
pub use node::Node;
pub use protocol::{Command, Message, MessageDecodeError};
pub use reassembly::{ChunkSet, InsertOutcome, ReassemblyError};
pub use wire::{decode_frame, encode_frame, Frame, FrameDecodeError, FrameEncodeError};
