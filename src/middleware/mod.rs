//! Request extractors shared by the HTTP and WebSocket handlers.

pub mod identity;

pub use identity::{ClientIdentity, HEADER_USER_ID};
