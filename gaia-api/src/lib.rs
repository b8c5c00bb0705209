//! Client for the remote identity service: the calls the cookie manager
//! needs to read and mutate the session cookie jar.

mod client;
mod error;
pub mod parse;
mod urls;

pub use crate::client::GaiaClient;
pub use crate::client::HttpGaiaClient;
pub use crate::error::map_transport_error;
pub use crate::urls::DEFAULT_SOURCE;
pub use crate::urls::GaiaUrls;
