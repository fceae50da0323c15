//! Spawning and signalling the supervised child
//!
//! Only Unix is supported. With `processGroup` enabled the child becomes the
//! leader of a new session, and signals reach every process in its group.

#[cfg(unix)]
pub mod unix;

#[cfg(unix)]
pub use unix::*;
