/// Base error type for midx-utils operations.
#[derive(Debug, thiserror::Error)]
pub enum UtilError {
    #[error("path error: {0}")]
    Path(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
