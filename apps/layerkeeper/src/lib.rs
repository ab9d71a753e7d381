//! # layerkeeper
//!
//! The layerkeeper binary's library target: HTTP API, CLI, configuration
//! and the app-level error type. The engine lives in `layerkeeper-core`.

pub mod api;
pub mod cli;
pub mod config;
pub mod error;
pub mod target;
