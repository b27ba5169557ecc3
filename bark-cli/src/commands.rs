pub mod hook;
pub mod install;
pub mod verify;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A rule violation or a cancelled transaction. The details have
    /// already been rendered.
    #[error("verification failed")]
    Denied,
    #[error(transparent)]
    Args(#[from] lexopt::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// `1` for denied verifications, `2` for configuration and usage
    /// failures.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Denied => 1,
            _ => 2,
        }
    }
}
