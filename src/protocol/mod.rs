//! Protocol module - control characters and framing.
//!
//! This module implements the VISA-1 line format:
//! - control characters and the terminator sets used by the handshake
//! - STX/ETX framing with an XOR longitudinal redundancy check (LRC)

pub mod control;
mod frame;

pub use frame::{compute_checksum, encode, verify, Frame, FRAME_OVERHEAD};
