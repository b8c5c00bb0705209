//! Types shared by the cookie manager, the account reconcilor and the remote
//! identity service client.

mod account_id;
pub mod accounts;
pub mod error;
pub mod events;
pub mod request;
pub mod state;

pub use account_id::AccountId;
pub use account_id::canonicalize_email;
pub use accounts::ConnectionCheckTarget;
pub use accounts::ListedAccount;
pub use error::GaiaError;
pub use events::CookieJarEvent;
pub use request::RequestId;
pub use request::SessionRequest;
pub use request::SessionRequestKind;
pub use state::PassSummary;
pub use state::ReconcileState;
pub use state::ReconcileTrigger;
