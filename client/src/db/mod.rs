//! SQLite persistence: entity tables, the offline queue and channel timestamps.

mod local_store;
mod pool;
mod queue;
mod timestamps;

pub use local_store::*;
pub use pool::*;
pub use queue::*;
pub use timestamps::*;
