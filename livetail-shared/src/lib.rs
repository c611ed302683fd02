#![cfg_attr(not(test), forbid(unsafe_code))]
#![deny(warnings, clippy::pedantic)]
#![allow(clippy::multiple_crate_versions)] // TODO(deps-001): remove once transitive dependencies converge.

//! Records, wire frames, filters, and configuration shared by the livetail
//! server, client library, and CLI.

pub mod config;
pub mod models;
