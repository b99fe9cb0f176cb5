//! Session and resource management
//!
//! Sessions own one engine worker and router each. The manager maps session
//! ids to sessions; each session indexes the transports, producers and
//! consumers created on it.

mod manager;
mod session;

pub use manager::{ManagerEvent, SessionManager};
pub use session::Session;
