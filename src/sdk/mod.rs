//! High-level client that wraps discovery output, authentication, control
//! and realtime streaming behind one handle.
pub mod client;

pub use client::{ClientError, XledClient};
