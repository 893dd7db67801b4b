//! Event fan-out and job logging.
//!
//! The [`EventBroadcaster`] is process-wide shared state behind a small
//! handle; the daemon owns the single instance and injects clones into
//! the engine. [`JobLogger`] writes colored per-job console lines and
//! mirrors each of them into the broadcaster as `log` events.

mod broadcaster;
mod logger;

pub use broadcaster::{EventBroadcaster, SUBSCRIBER_BUFFER};
pub use logger::JobLogger;
