//! Signaling client for the SFU server
//!
//! [`SfuClient`] offers one typed method per request type. Underneath,
//! [`RequestChannel`] correlates replies by UUID and keeps outgoing frames in
//! call order.

pub mod channel;
pub mod client;
pub mod error;
pub mod queue;
pub mod websocket;

pub use channel::{DEFAULT_REQUEST_TIMEOUT, RequestChannel};
pub use client::{ClientOptions, SfuClient};
pub use error::{ClientError, Result};
pub use queue::SerialTaskQueue;
