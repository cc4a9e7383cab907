//! Coordinates worker processes that poll the same mail accounts: one session
//! per account, a cross-process folder lock, and MIME body flattening.
pub mod app;
pub mod cli;
pub mod config;
pub mod errors;
pub mod lock;
pub mod mime;
pub mod poller;
pub mod registry;
pub mod session;
pub mod transport;
pub mod types;

pub use errors::{AppError, AppResult};
pub use registry::SessionRegistry;
pub use session::MailboxSession;
