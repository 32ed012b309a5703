pub mod clock;

pub use clock::{duration_ms, Clock, ManualClock, SystemClock};
