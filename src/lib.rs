//! Core library for the transcription orchestration service: a durable job
//! store, a progress broker, a bounded worker pool driving a transcription
//! engine adapter, a batch coordinator, a cancellation registry, and a
//! retention sweeper, fronted by a `Service` facade and an agent-tool
//! contract. Binaries (the `transcribed` CLI, or an embedding HTTP/agent
//! host) depend on this crate rather than duplicating orchestration logic.

pub mod batch;
pub mod broker;
pub mod cancel;
pub mod config;
pub mod engine;
pub mod error;
pub mod job;
pub mod jobstore;
pub mod merge;
pub mod retention;
pub mod service;
pub mod tool_surface;
pub mod worker;
