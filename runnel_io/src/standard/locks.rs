//! parking_lot locks for stream state.
//!
//! Every stream keeps its readable, writable and transform state behind one of
//! these. A guard is never held across a user hook, a completion callback or
//! an event emission, so re-entrant calls from those places find the lock free.

/// Guards one side of a stream
pub type Mutex<T> = parking_lot::Mutex<T>;
