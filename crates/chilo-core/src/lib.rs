//! Core mutation pipeline and bandit-based selection/energy scheduler for a
//! coverage-guided database-fuzzer augmentation layer.
//!
//! This crate carries no FFI surface; `chilo-mutator` adapts [`HostBridge`]
//! to the host fuzzer's `extern "C"` entry points.

pub mod config;
pub mod coverage;
pub mod crash_library;
pub mod csv_log;
pub mod error;
mod host_bridge;
pub mod llm;
pub mod mutator;
pub mod pipeline;
pub mod seed;

pub use host_bridge::{HostBridge, HostBridgeDeps, Strategy};
