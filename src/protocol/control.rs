//! VISA-1 control characters.
//!
//! The link is a 7-bit ASCII line discipline. Data frames are delimited by
//! STX/ETX and followed by an LRC byte; everything else on the line is a
//! single control character.

/// Start of header.
pub const SOH: u8 = 0x01;
/// Start of text, opens a data frame.
pub const STX: u8 = 0x02;
/// End of text, closes a data frame and seeds the LRC.
pub const ETX: u8 = 0x03;
/// End of transmission.
pub const EOT: u8 = 0x04;
/// Enquiry. Sent by the host as the idle tone when it is ready to receive.
pub const ENQ: u8 = 0x05;
/// Positive acknowledge.
pub const ACK: u8 = 0x06;
/// Data link escape.
pub const DLE: u8 = 0x10;
/// Negative acknowledge.
pub const NAK: u8 = 0x15;

/// Marker the terminal waits for before transmitting.
pub const IDLE_TONE: u8 = ENQ;

/// Terminators for the idle wait.
pub const IDLE_TERMINATORS: &[u8] = &[IDLE_TONE];

/// Terminators for the acknowledge wait after a transmit.
pub const ACK_TERMINATORS: &[u8] = &[ACK, NAK];

/// Every control character that ends a read in the receive phase.
pub const FRAME_DELIMITERS: &[u8] = &[SOH, STX, ETX, EOT, ENQ, ACK, DLE, NAK];

/// Mnemonic for a control character, if it is one of ours.
pub fn name(byte: u8) -> Option<&'static str> {
    match byte {
        SOH => Some("SOH"),
        STX => Some("STX"),
        ETX => Some("ETX"),
        EOT => Some("EOT"),
        ENQ => Some("ENQ"),
        ACK => Some("ACK"),
        DLE => Some("DLE"),
        NAK => Some("NAK"),
        _ => None,
    }
}

/// Render raw line bytes for diagnostics.
///
/// Control characters appear by name (`[STX]`), printable ASCII verbatim,
/// anything else as `[0xNN]`.
///
/// # Example
///
/// ```
/// use visa1_link::protocol::control::{dump, ETX, STX};
///
/// assert_eq!(dump(&[STX, b'O', b'K', ETX, 0x7f]), "[STX]OK[ETX][0x7F]");
/// ```
pub fn dump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        match name(b) {
            Some(n) => {
                out.push('[');
                out.push_str(n);
                out.push(']');
            }
            None if b.is_ascii_graphic() || b == b' ' => out.push(b as char),
            None => out.push_str(&format!("[0x{:02X}]", b)),
        }
    }
    out
}
