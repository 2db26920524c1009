use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HuffmanError {
    #[error("frequency table has no nonzero entries")]
    EmptyFrequencyTable,
    #[error("code length exceeds 16 bits")]
    CodeTooLong,
    #[error("invalid codeword in compressed stream")]
    InvalidCode,
    #[error("compressed stream ended before the terminator")]
    Truncated,
    #[error("decoder stopped advancing")]
    Stalled,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FragmentError {
    #[error("frame needs {fragments} fragments, limit is 127")]
    TooLarge { fragments: usize },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("delta payload ended early")]
    Truncated,
    #[error("malformed delta payload: {0}")]
    Malformed(&'static str),
}
