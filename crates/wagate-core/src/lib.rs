//! # wagate-core
//!
//! Core types, traits, configuration, and error handling for the wagate
//! session gateway.

pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod protocol;
pub mod session;

pub use config::shellexpand;
