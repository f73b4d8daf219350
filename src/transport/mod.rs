//! Transport module - TCP connection handling.
//!
//! Provides:
//! - [`Endpoint`] naming the server
//! - [`connect`] with resolution and an optional bound
//! - [`ReadStop`] classifying why reads ended

mod tcp;

pub use tcp::{connect, Endpoint, ReadStop};
