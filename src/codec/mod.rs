//! Codec module - message packagers.
//!
//! The link moves opaque payloads; a [`Packager`] turns the caller's
//! message type into those payloads and back. Field-level ISO-8583
//! packing lives outside this crate and plugs in through the same trait.
//!
//! - [`RawPackager`] - pass-through for already-packed bytes
//! - [`JsonPackager`] - serde structured messages as JSON text
//!
//! # Example
//!
//! ```
//! use visa1_link::codec::{Packager, RawPackager};
//! use bytes::Bytes;
//!
//! let packager = RawPackager;
//! let packed = packager.pack(&Bytes::from_static(b"0100")).unwrap();
//! assert_eq!(&packed[..], b"0100");
//! ```

mod json;
mod raw;

use bytes::Bytes;

use crate::error::Result;

pub use json::JsonPackager;
pub use raw::RawPackager;

/// Converts between a message type and the payload carried in a frame.
///
/// Both directions may fail with a format error. The link worker calls
/// `pack` right before transmitting and `unpack` on the accepted payload.
pub trait Packager: Send + Sync + 'static {
    /// Structured message type exchanged with callers.
    type Message: Send + Sync + 'static;

    /// Pack a message into frame payload bytes.
    fn pack(&self, message: &Self::Message) -> Result<Bytes>;

    /// Unpack a received payload.
    fn unpack(&self, payload: &[u8]) -> Result<Self::Message>;
}
