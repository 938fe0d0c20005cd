//! Application layer: durable-store contracts and top-level errors.

pub mod error;
pub mod repos;
