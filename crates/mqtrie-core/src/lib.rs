//! mqtrie-core - Core MQTT types and codec.
//!
//! This crate provides the fundamental types for MQTT 3.1.1 packet
//! encoding/decoding, shared between the broker and its test clients.

pub mod error;
pub mod packet;
pub mod varint;

pub use error::{Error, ProtocolError, Result};
pub use packet::*;
