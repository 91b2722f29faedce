//! Runtime plumbing shared by every component
//!
//! - [`Clock`]: the only source of "now" for expiry, refill and idle checks
//! - [`BackgroundTask`]: cancellable periodic loops tied to a component's lifecycle

mod clock;
mod task;

pub use clock::{expires_at, Clock, ManualClock, SystemClock};
pub use task::BackgroundTask;
