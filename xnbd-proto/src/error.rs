/// Failure to pack or unpack a command or an answer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("truncated message: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("unknown command kind: {0}")]
    UnknownKind(u32),

    #[error("unknown io opcode: {0}")]
    UnknownOpcode(u32),

    #[error("expected a {expected:?} answer, got {got:?}")]
    KindMismatch {
        expected: crate::CommandKind,
        got: crate::CommandKind,
    },

    #[error("path is not valid utf-8")]
    InvalidPath,

    #[error("path of {0} bytes exceeds the limit of {}", crate::MAX_PATH_LEN)]
    PathTooLong(usize),
}
