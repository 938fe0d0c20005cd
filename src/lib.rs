//! Cache-consistency engine keeping relation bitmaps, counters and entity
//! snapshots in step with a durable store.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
