#![cfg_attr(not(test), forbid(unsafe_code))]

//! livetail server: admin tail sessions (backlog, then deduplicated live
//! changes) and resumable chat generation streams over SSE.

pub mod app_state;
pub mod auth;
mod db;
mod handlers;
pub mod http;
mod middleware;
pub mod openapi;
mod routes;
pub mod server;
pub mod services;
mod tracer;

pub use app_state::{AppState, MemoryStores};
