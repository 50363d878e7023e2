//! # trellis-overlay
//!
//! Wire-format building blocks for the Trellis mesh overlay.
//!
//! ## Crate structure
//!
//! - [`buffer`] — bounded append buffer with checkpoint/rewind, read cursor
//! - [`address`] — subscriber identities and the abbreviating address codec
//! - [`frame`] — variable-layout overlay frame headers
//! - [`mdp`] — port-pair payload prefix

pub mod address;
pub mod buffer;
pub mod frame;
pub mod mdp;

use thiserror::Error;

/// Wire-level failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum OverlayError {
    /// An append would exceed the buffer's size limit.
    #[error("buffer full")]
    BufferFull,
    /// The ttl does not fit the 5-bit wire field.
    #[error("invalid ttl {0}")]
    InvalidTtl(u8),
    /// The payload ended in the middle of a field.
    #[error("payload truncated")]
    Truncated,
    /// A required address was missing or malformed.
    #[error("invalid address reference")]
    InvalidAddress,
}
