use thiserror::Error;

#[derive(Error, Debug)]
pub enum KVError {
    #[error("key '{0}' not found")]
    NotFound(String),

    #[error("open store error: {0}")]
    Open(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("store is closed")]
    Closed,
}

impl KVError {
    /// True when the error only reports an absent key.
    pub fn is_not_found(&self) -> bool {
        matches!(self, KVError::NotFound(_))
    }
}
