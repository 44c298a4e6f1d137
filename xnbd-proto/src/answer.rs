use bytes::{Buf, BufMut};

use crate::{ensure, CodecError, CommandKind};

const ANSWER_HEADER_LEN: usize = 16;
const STAT_LEN: usize = 8 + 4 + 4 + 8 + 8;

/// Remote `fstat` result, the fields the block layer cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RemoteStat {
    pub size: u64,
    pub mode: u32,
    pub blksize: u32,
    pub blocks: u64,
    pub mtime: i64,
}

/// Successful answer body, per command kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    Open { fd: i32 },
    Fstat(RemoteStat),
    Setup,
    Submit { data_len: u32 },
}

impl Answer {
    pub fn kind(&self) -> CommandKind {
        match self {
            Answer::Open { .. } => CommandKind::Open,
            Answer::Fstat(_) => CommandKind::Fstat,
            Answer::Setup => CommandKind::IoSetup,
            Answer::Submit { .. } => CommandKind::IoSubmit,
        }
    }
}

/// An answer as it travels back: the command kind, the remote `ret`/`errno` pair and,
/// iff `ret == 0`, the answer body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    pub kind: CommandKind,
    pub ret: i32,
    pub ret_errno: i32,
    pub answer: Option<Answer>,
}

impl Reply {
    pub fn success(answer: Answer) -> Self {
        Reply {
            kind: answer.kind(),
            ret: 0,
            ret_errno: 0,
            answer: Some(answer),
        }
    }

    pub fn failure(kind: CommandKind, errno: i32) -> Self {
        Reply {
            kind,
            ret: -1,
            ret_errno: errno,
            answer: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.ret == 0
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        let payload_len = match self.answer {
            Some(Answer::Open { .. }) => 4,
            Some(Answer::Fstat(_)) => STAT_LEN,
            Some(Answer::Submit { .. }) => 4,
            Some(Answer::Setup) | None => 0,
        };
        buf.put_u32_le(self.kind as u32);
        buf.put_u32_le(payload_len as u32);
        buf.put_i32_le(self.ret);
        buf.put_i32_le(self.ret_errno);
        match self.answer {
            Some(Answer::Open { fd }) => buf.put_i32_le(fd),
            Some(Answer::Fstat(stat)) => {
                buf.put_u64_le(stat.size);
                buf.put_u32_le(stat.mode);
                buf.put_u32_le(stat.blksize);
                buf.put_u64_le(stat.blocks);
                buf.put_i64_le(stat.mtime);
            }
            Some(Answer::Submit { data_len }) => buf.put_u32_le(data_len),
            Some(Answer::Setup) | None => {}
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let kind = crate::peek_kind(buf)?;
        ensure(buf, ANSWER_HEADER_LEN)?;
        let mut cursor = &buf[4..];
        let payload_len = cursor.get_u32_le() as usize;
        let ret = cursor.get_i32_le();
        let ret_errno = cursor.get_i32_le();
        ensure(cursor, payload_len)?;
        if ret != 0 {
            return Ok(Reply {
                kind,
                ret,
                ret_errno,
                answer: None,
            });
        }
        let mut payload = &cursor[..payload_len];
        let answer = match kind {
            CommandKind::Open => {
                ensure(payload, 4)?;
                Answer::Open {
                    fd: payload.get_i32_le(),
                }
            }
            CommandKind::Fstat => {
                ensure(payload, STAT_LEN)?;
                Answer::Fstat(RemoteStat {
                    size: payload.get_u64_le(),
                    mode: payload.get_u32_le(),
                    blksize: payload.get_u32_le(),
                    blocks: payload.get_u64_le(),
                    mtime: payload.get_i64_le(),
                })
            }
            CommandKind::IoSetup => Answer::Setup,
            CommandKind::IoSubmit => {
                ensure(payload, 4)?;
                Answer::Submit {
                    data_len: payload.get_u32_le(),
                }
            }
        };
        Ok(Reply {
            kind,
            ret,
            ret_errno,
            answer: Some(answer),
        })
    }

    /// Decode and check that the answer belongs to a command of kind `expected`.
    pub fn decode_expecting(buf: &[u8], expected: CommandKind) -> Result<Self, CodecError> {
        let reply = Self::decode(buf)?;
        if reply.kind != expected {
            return Err(CodecError::KindMismatch {
                expected,
                got: reply.kind,
            });
        }
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_reply_carries_errno_and_no_body() {
        let mut buf = Vec::new();
        Reply::failure(CommandKind::Fstat, libc::ENOENT).encode(&mut buf);
        let reply = Reply::decode(&buf).unwrap();
        assert!(!reply.is_success());
        assert_eq!(reply.ret_errno, libc::ENOENT);
        assert_eq!(reply.answer, None);
    }

    #[test]
    fn stat_reply_survives_encoding() {
        let stat = RemoteStat {
            size: 4096,
            mode: 0o100644,
            blksize: 4096,
            blocks: 8,
            mtime: 1_392_000_000,
        };
        let mut buf = Vec::new();
        Reply::success(Answer::Fstat(stat)).encode(&mut buf);
        let reply = Reply::decode_expecting(&buf, CommandKind::Fstat).unwrap();
        assert_eq!(reply.answer, Some(Answer::Fstat(stat)));
    }

    #[test]
    fn kind_mismatch_is_reported() {
        let mut buf = Vec::new();
        Reply::success(Answer::Setup).encode(&mut buf);
        assert_eq!(
            Reply::decode_expecting(&buf, CommandKind::Open),
            Err(CodecError::KindMismatch {
                expected: CommandKind::Open,
                got: CommandKind::IoSetup,
            })
        );
    }

    #[test]
    fn short_header_is_truncated() {
        let buf = (CommandKind::Open as u32).to_le_bytes();
        assert!(matches!(
            Reply::decode(&buf),
            Err(CodecError::Truncated { .. })
        ));
    }
}
