//! Async lock primitives used by the connection pool

mod keyed;
mod mutex;

pub use keyed::KeyedMutex;
pub use mutex::{Mutex, MutexGuard};
