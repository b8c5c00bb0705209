//! Root of the `reconcilor-core` library.

// Library code reports through tracing only.
#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod backoff;
pub mod collaborators;
pub mod config;
pub mod cookie_manager;
pub mod error;
pub mod memory;
pub mod observers;
pub mod reconcilor;
mod util;

pub use config::ConfigToml;
pub use config::ReconcilorConfig;
pub use cookie_manager::ExternalCcResultFetcher;
pub use cookie_manager::GaiaCookieManager;
pub use error::ReconcilorErr;
pub use reconcilor::AccountReconcilor;
pub use reconcilor::ReconcilorStatus;
pub use reconcilor_protocol as protocol;
