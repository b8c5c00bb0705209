use thiserror::Error;

use crate::config::ConfigError;

pub type Result<T> = std::result::Result<T, ReconcilorErr>;

#[derive(Error, Debug)]
pub enum ReconcilorErr {
    /// The session request service no longer accepts requests.
    #[error("cookie manager has shut down")]
    CookieManagerShutDown,

    #[error("account reconcilor has shut down")]
    ReconcilorShutDown,

    #[error(transparent)]
    Config(#[from] ConfigError),
}
