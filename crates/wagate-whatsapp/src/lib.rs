//! # wagate-whatsapp
//!
//! WhatsApp protocol adapter for wagate, built on `whatsapp-rust`.
//!
//! - `device_store`: one SQLite database holding the credentials of every
//!   device, scoped by device id, implementing the `whatsapp-rust` storage
//!   backend traits
//! - `client`: a `ProtocolClient` driving one `whatsapp-rust` bot
//! - `qr`: terminal and PNG rendering of QR pairing codes

mod client;
pub mod device_store;
mod events;
pub mod qr;

#[cfg(test)]
mod tests;

pub use client::WhatsAppClient;
pub use device_store::SqlxDeviceContainer;
pub use qr::{generate_qr_image, generate_qr_terminal};
