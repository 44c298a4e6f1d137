use bytes::{Buf, BufMut};

use crate::{ensure, CodecError, HEADER_LEN, MAX_PATH_LEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CommandKind {
    Open = 1,
    Fstat = 2,
    IoSetup = 3,
    IoSubmit = 4,
}

impl CommandKind {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(CommandKind::Open),
            2 => Some(CommandKind::Fstat),
            3 => Some(CommandKind::IoSetup),
            4 => Some(CommandKind::IoSubmit),
            _ => None,
        }
    }

    /// Control commands are answered through a connection's single control slot,
    /// everything else is data plane.
    pub fn is_control(&self) -> bool {
        !matches!(self, CommandKind::IoSubmit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum IoOpcode {
    Read = 1,
    Write = 2,
}

impl IoOpcode {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(IoOpcode::Read),
            2 => Some(IoOpcode::Write),
            _ => None,
        }
    }
}

/// A single positional read or write of at most [`crate::SUBMIT_BLOCK_SIZE`] bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitCommand {
    pub fd: i32,
    pub opcode: IoOpcode,
    pub offset: u64,
    pub len: u32,
}

impl SubmitCommand {
    /// Submits carry no variable-length fields, so encoding them cannot fail.
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(CommandKind::IoSubmit as u32);
        buf.put_u32_le(SUBMIT_PAYLOAD_LEN as u32);
        self.encode_payload(buf);
    }

    fn encode_payload<B: BufMut>(&self, buf: &mut B) {
        buf.put_i32_le(self.fd);
        buf.put_u32_le(self.opcode as u32);
        buf.put_u64_le(self.offset);
        buf.put_u32_le(self.len);
    }
}

const SUBMIT_PAYLOAD_LEN: usize = 4 + 4 + 8 + 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Open { path: String, flags: i32 },
    Fstat { fd: i32 },
    Setup { fd: i32, queue_depth: u32 },
    Submit(SubmitCommand),
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Open { .. } => CommandKind::Open,
            Command::Fstat { .. } => CommandKind::Fstat,
            Command::Setup { .. } => CommandKind::IoSetup,
            Command::Submit(_) => CommandKind::IoSubmit,
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Command::Open { path, .. } => 4 + 4 + path.len(),
            Command::Fstat { .. } => 4,
            Command::Setup { .. } => 4 + 4,
            Command::Submit(_) => SUBMIT_PAYLOAD_LEN,
        }
    }

    /// Append the encoded command to `buf`.
    pub fn encode<B: BufMut>(&self, buf: &mut B) -> Result<(), CodecError> {
        if let Command::Open { path, .. } = self {
            if path.len() > MAX_PATH_LEN {
                return Err(CodecError::PathTooLong(path.len()));
            }
        }
        buf.put_u32_le(self.kind() as u32);
        buf.put_u32_le(self.payload_len() as u32);
        match self {
            Command::Open { path, flags } => {
                buf.put_i32_le(*flags);
                buf.put_u32_le(path.len() as u32);
                buf.put_slice(path.as_bytes());
            }
            Command::Fstat { fd } => buf.put_i32_le(*fd),
            Command::Setup { fd, queue_depth } => {
                buf.put_i32_le(*fd);
                buf.put_u32_le(*queue_depth);
            }
            Command::Submit(submit) => submit.encode_payload(buf),
        }
        Ok(())
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let kind = crate::peek_kind(buf)?;
        ensure(buf, HEADER_LEN)?;
        let mut cursor = &buf[4..];
        let payload_len = cursor.get_u32_le() as usize;
        ensure(cursor, payload_len)?;
        let mut payload = &cursor[..payload_len];
        let command = match kind {
            CommandKind::Open => {
                ensure(payload, 8)?;
                let flags = payload.get_i32_le();
                let path_len = payload.get_u32_le() as usize;
                if path_len > MAX_PATH_LEN {
                    return Err(CodecError::PathTooLong(path_len));
                }
                ensure(payload, path_len)?;
                let path = std::str::from_utf8(&payload[..path_len])
                    .map_err(|_| CodecError::InvalidPath)?
                    .to_owned();
                Command::Open { path, flags }
            }
            CommandKind::Fstat => {
                ensure(payload, 4)?;
                Command::Fstat {
                    fd: payload.get_i32_le(),
                }
            }
            CommandKind::IoSetup => {
                ensure(payload, 8)?;
                Command::Setup {
                    fd: payload.get_i32_le(),
                    queue_depth: payload.get_u32_le(),
                }
            }
            CommandKind::IoSubmit => {
                ensure(payload, 20)?;
                let fd = payload.get_i32_le();
                let raw_opcode = payload.get_u32_le();
                let opcode =
                    IoOpcode::from_u32(raw_opcode).ok_or(CodecError::UnknownOpcode(raw_opcode))?;
                Command::Submit(SubmitCommand {
                    fd,
                    opcode,
                    offset: payload.get_u64_le(),
                    len: payload.get_u32_le(),
                })
            }
        };
        Ok(command)
    }
}
