//! Wire codecs.
//!
//! Each codec is a set of pure functions from (operation, payload) to
//! outgoing bytes and from received bytes back to a payload or a
//! [`DecodeError`](crate::error::DecodeError). Frames are rebuilt per call.
//!
//! - [`checksum`]: checksummed fixed-point frames (thermoelectric controller)
//! - [`tagged`]: tagged free-text commands (microcontroller devices)
//! - [`relay`]: addressed relay-module commands (valve banks)

pub mod checksum;
pub mod relay;
pub mod tagged;
