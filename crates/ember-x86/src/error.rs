use thiserror::Error;

/// Reasons instruction-length decoding can fail.
///
/// `TooShort` is a signal to the caller that more bytes may help;
/// `InstrTooLong` means the 15-byte architectural cap was reached and the
/// instruction can never become valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The buffer ended before the instruction did.
    #[error("instruction truncated after {0} bytes")]
    TooShort(u8),
    /// The encoding would exceed the 15-byte limit.
    #[error("instruction longer than 15 bytes")]
    InstrTooLong,
    /// A reserved opcode-map escape (`0F 0F`, `0F 39`, `0F 3B`..`0F 3F`).
    #[error("reserved opcode map escape")]
    BadMap,
    /// An opcode whose length-decoding attributes are undefined.
    #[error("undecodable opcode")]
    General,
}
