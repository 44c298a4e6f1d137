//! Pack/unpack of the commands exchanged between an xnbd client and a remote aio server.
//!
//! Every message has a header of two little-endian `u32`s, the [`CommandKind`] and the
//! length of the payload that follows. Answers extend the header with the remote `ret`
//! and `errno`. Bulk data (the write payload of an [`IoSubmit`] or the data returned by a
//! read) never travels in the header; transports carry it as a separate data segment.
//!
//! [`IoSubmit`]: CommandKind::IoSubmit

mod answer;
mod command;
mod error;

pub use answer::{Answer, RemoteStat, Reply};
pub use command::{Command, CommandKind, IoOpcode, SubmitCommand};
pub use error::CodecError;

/// Upper bound for an encoded control command header.
pub const MAX_MSG_LEN: usize = 512;

/// Upper bound for a remote file path inside an OPEN command.
pub const MAX_PATH_LEN: usize = 256;

/// The fixed transfer unit of a single IO_SUBMIT.
pub const SUBMIT_BLOCK_SIZE: usize = 16 * 1024;

/// Flags a block device opens its backing remote file with.
pub const OPEN_FLAGS_RDWR: i32 = libc::O_RDWR;

pub(crate) const HEADER_LEN: usize = 8;

/// Read the command kind of an encoded command or answer without decoding the rest.
pub fn peek_kind(buf: &[u8]) -> Result<CommandKind, CodecError> {
    if buf.len() < 4 {
        return Err(CodecError::Truncated {
            needed: 4,
            available: buf.len(),
        });
    }
    let raw = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    CommandKind::from_u32(raw).ok_or(CodecError::UnknownKind(raw))
}

pub(crate) fn ensure(buf: &[u8], needed: usize) -> Result<(), CodecError> {
    if buf.len() < needed {
        Err(CodecError::Truncated {
            needed,
            available: buf.len(),
        })
    } else {
        Ok(())
    }
}
