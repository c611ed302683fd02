//! Tail sessions over a backlog source and a change feed, plus the chat
//! generation pipeline.

pub mod backlog;
pub mod change_source;
pub mod chat_service;
pub mod generation;
pub mod memory_store;
pub mod message_repository;
pub mod multiplexer;
pub mod stream_supervisor;
pub mod tail_session;
