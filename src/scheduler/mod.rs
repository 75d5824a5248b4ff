pub mod cancel;
pub mod host;
pub mod occurrence;
pub mod sweep;
pub mod throttle;

pub use cancel::CancellationRegistry;
pub use host::SchedulerHost;
pub use occurrence::{Occurrence, OccurrenceKind, OccurrenceStatus};
pub use throttle::RestartThrottle;
