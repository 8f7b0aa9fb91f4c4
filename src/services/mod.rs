//! Business logic: presence, POI membership, event fan-out, rate limiting and
//! session reconciliation.

pub mod events;
pub mod membership;
pub mod poi;
pub mod presence;
pub mod rate_limit;
pub mod retry;
pub mod session;

pub use events::{EventFanout, EventSubscription};
pub use membership::MembershipRegistry;
pub use poi::PoiService;
pub use presence::{ExpiredPresence, PresenceStore};
pub use rate_limit::{Clock, ManualClock, RateLimit, RateLimiter, SystemClock};
pub use retry::RetryPolicy;
pub use session::{ConnectedSession, SessionReconciler};
