//! Frame codec.
//!
//! A VISA-1 data frame on the wire:
//! ```text
//! ┌─────┬──────────────┬─────┬─────┐
//! │ STX │ payload      │ ETX │ LRC │
//! │ 1   │ n bytes      │ 1   │ 1   │
//! └─────┴──────────────┴─────┴─────┘
//! ```
//!
//! The LRC is the XOR of every payload byte seeded with ETX, which is the
//! same as XOR-ing everything after STX up to and including ETX.
//!
//! # Example
//!
//! ```
//! use visa1_link::protocol::{encode, Frame};
//!
//! let wire = encode(b"0100");
//! let frame = Frame::decode(&wire).unwrap();
//! assert_eq!(frame.payload(), b"0100");
//! assert!(frame.is_valid());
//! ```

use bytes::Bytes;

use super::control::{ETX, STX};

/// Bytes a frame adds around its payload (STX, ETX, LRC).
pub const FRAME_OVERHEAD: usize = 3;

/// Compute the LRC of a payload.
#[inline]
pub fn compute_checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(ETX, |lrc, b| lrc ^ b)
}

/// Check a received payload against the LRC byte that followed it.
#[inline]
pub fn verify(payload: &[u8], checksum: u8) -> bool {
    compute_checksum(payload) == checksum
}

/// Build a complete wire frame as a single byte vector.
///
/// The frame goes out in one write so the whole of it can be logged as
/// one unit.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(payload.len() + FRAME_OVERHEAD);
    buf.push(STX);
    buf.extend_from_slice(payload);
    buf.push(ETX);
    buf.push(compute_checksum(payload));
    buf
}

/// A payload together with the LRC that travels with it.
///
/// Built fresh for every send or receive attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    payload: Bytes,
    checksum: u8,
}

impl Frame {
    /// Frame an outgoing payload, computing its LRC.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        let checksum = compute_checksum(&payload);
        Self { payload, checksum }
    }

    /// A frame as received: payload plus the LRC byte the remote sent.
    pub fn received(payload: impl Into<Bytes>, checksum: u8) -> Self {
        Self {
            payload: payload.into(),
            checksum,
        }
    }

    /// Parse a full `STX payload ETX LRC` sequence.
    ///
    /// Returns `None` if the markers are missing. The LRC is not checked
    /// here; use [`Frame::is_valid`].
    pub fn decode(wire: &[u8]) -> Option<Self> {
        if wire.len() < FRAME_OVERHEAD || wire[0] != STX || wire[wire.len() - 2] != ETX {
            return None;
        }
        let payload = &wire[1..wire.len() - 2];
        Some(Self::received(
            Bytes::copy_from_slice(payload),
            wire[wire.len() - 1],
        ))
    }

    /// Payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Consume the frame, returning the payload.
    #[inline]
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// LRC carried by this frame.
    #[inline]
    pub fn checksum(&self) -> u8 {
        self.checksum
    }

    /// Whether the carried LRC matches the payload.
    #[inline]
    pub fn is_valid(&self) -> bool {
        verify(&self.payload, self.checksum)
    }

    /// Wire representation.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.payload.len() + FRAME_OVERHEAD);
        buf.push(STX);
        buf.extend_from_slice(&self.payload);
        buf.push(ETX);
        buf.push(self.checksum);
        buf
    }
}
