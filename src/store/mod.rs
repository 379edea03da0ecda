//! Counter storage: backends, the facade over them, and fixed-window counting.

mod backend;
mod cache;
mod clock;
mod memory;
mod window;

pub use backend::{Capability, CounterBackend};
pub use cache::{Cache, DEFAULT_PREFIX, DEFAULT_TIMEOUT};
pub use clock::{Clock, ManualClock, SystemClock};
pub use memory::MemoryStore;
pub use window::{TimeWindow, WindowCounter, WindowKey};
