#![warn(missing_docs)]

//! Keepsafe management: configuration loading, service wiring, the operator
//! CLI and the scheduler daemon.

pub mod app;
pub mod cli;
pub mod config;

pub use app::Keepsafe;
pub use config::{KeepsafeConfig, LogFormat};
