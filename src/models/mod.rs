//! Data models for presence, POIs, sessions, events and rate limits.

pub mod channel;
pub mod event;
pub mod poi;
pub mod presence;
pub mod rate_limit;
pub mod session;

pub use channel::*;
pub use event::*;
pub use poi::*;
pub use presence::*;
pub use rate_limit::*;
pub use session::*;
