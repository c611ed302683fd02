//! # Configuration
//!
//! Server and client configuration structures, file loading and
//! environment overrides.

pub mod client;
pub mod server;
