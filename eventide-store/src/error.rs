#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unexpected original version of `{stream_id}`, expected {expected} found {actual}")]
    UnexpectedOriginalVersion {
        stream_id: String,
        expected: u64,
        actual: u64,
    },
}

pub type Result<T> = std::result::Result<T, StoreError>;
