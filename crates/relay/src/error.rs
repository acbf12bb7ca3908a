use thiserror::Error;

use crate::host::ResourceError;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("failed to acquire service resources: {0}")]
    Resource(#[from] ResourceError),
}

pub type Result<T> = std::result::Result<T, RelayError>;
