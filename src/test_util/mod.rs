//! This module contains utilities that are useful for testing code built on
//!  the engine. They are used for testing the engine itself, but they are also
//!  exported for application testing.
//!
//! Deterministic stand-ins for the injectable seams: a backend that collects
//!  parcels and events instead of doing I/O, and a randomness source that
//!  plays back a script. Making test utilities part of the crate's regular
//!  (non-#[cfg(test)]) code is the compromise that lets downstream crates use
//!  them too.

pub mod backend;
pub mod random;
