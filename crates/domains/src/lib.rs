//! # domains
//!
//! Core models, port traits and the error taxonomy of the deliberation engine. This crate does
//! no I/O; adapters implement the ports and services orchestrate them.

pub mod errors;
pub mod models;
pub mod ports;

pub use errors::*;
pub use models::*;
pub use ports::*;
