//! Foundation utilities for the midxr multi-pack-index library.
//!
//! Bounded binary reads over untrusted buffers, atomic whole-file
//! replacement, and the base error type shared by the higher crates.

pub mod atomic;
pub mod binread;
pub mod error;

pub use error::UtilError;

pub type Result<T> = std::result::Result<T, UtilError>;
