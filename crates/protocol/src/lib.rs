//! Wire protocol between the tracebench client and the inference peer.
//!
//! All multi-byte integers and floats are big-endian. Fixed-width records
//! are encoded field by field and never rely on in-memory struct layout.
//! See [`wire`] for the full message sequence.

pub mod constants;
pub mod error;
pub mod wire;

pub use error::ProtocolError;
pub use wire::{Checksum, FileHeader, ProbeReply};
