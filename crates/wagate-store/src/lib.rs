//! # wagate-store
//!
//! Durable session repository for wagate (SQLite-backed).

pub mod error;
pub mod store;

pub use error::StoreError;
pub use store::SessionRepository;
