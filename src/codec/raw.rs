//! Raw packager - pass-through for binary data.
//!
//! Used when the caller already holds packed message bytes.
//!
//! # Example
//!
//! ```
//! use visa1_link::codec::{Packager, RawPackager};
//!
//! let unpacked = RawPackager.unpack(b"0110APROBADO").unwrap();
//! assert_eq!(&unpacked[..], b"0110APROBADO");
//! ```

use bytes::Bytes;

use super::Packager;
use crate::error::Result;

/// Packager whose messages are the payload bytes themselves.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawPackager;

impl Packager for RawPackager {
    type Message = Bytes;

    /// Zero-copy: returns a clone of the same `Bytes`.
    #[inline]
    fn pack(&self, message: &Bytes) -> Result<Bytes> {
        Ok(message.clone())
    }

    #[inline]
    fn unpack(&self, payload: &[u8]) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(payload))
    }
}
