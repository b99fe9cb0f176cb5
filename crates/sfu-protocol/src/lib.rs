//! Shared protocol definitions for the SFU signaling server and its clients.
//!
//! Every frame is a JSON object. Requests carry a `type`, an optional session
//! `id`, a correlation `uuid` and a `payload`; replies echo the `uuid` and
//! carry either a `payload` or an `error`.

mod messages;
mod types;

pub use messages::*;
pub use types::*;
