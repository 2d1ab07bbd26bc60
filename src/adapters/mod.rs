//! Transport implementations
//!
//! A [`Transport`] moves raw command bytes to a device and returns the reply
//! lines. It knows nothing about codecs: checksum and tag semantics are layered
//! on top of whatever it successfully receives.
//!
//! Implementations take `&self` and serialize exchanges internally so that one
//! port can be shared by several instruments (for example relay modules on a
//! common bus) while every reply still pairs with its command.

pub mod mock;
pub mod serial_adapter;

pub use mock::MockTransport;
pub use serial_adapter::SerialTransport;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::AppResult;

/// Byte-level link to one device or bus.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Human-readable name used in log lines.
    fn name(&self) -> &str;

    /// Open the underlying port.
    async fn open(&self) -> AppResult<()>;

    /// Write `command` and, if `expect_response` is set, wait up to `timeout`
    /// for a delimited reply.
    ///
    /// Without `expect_response` success only means the write was accepted
    /// and the returned vector is empty. With it, a missing reply resolves to
    /// [`DaqError::TransportTimeout`](crate::error::DaqError::TransportTimeout).
    async fn send(
        &self,
        command: &[u8],
        expect_response: bool,
        timeout: Duration,
    ) -> AppResult<Vec<String>>;
}
