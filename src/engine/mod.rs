//! Acquisition engine — per-account workers and their manager.

pub mod manager;
pub mod worker;

pub use manager::Manager;
pub use worker::{Worker, WorkerConfig};
