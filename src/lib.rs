//! # visa1-link
//!
//! Client side of the VISA-1 link protocol: a point-to-point, half-duplex
//! line discipline for moving ISO-8583 style authorization messages over
//! slow and unreliable serial-class lines such as dial-up modems.
//!
//! ## Architecture
//!
//! - **Framing** (`protocol`): `STX payload ETX LRC`, XOR checksum seeded with ETX
//! - **Handshake** (`handshake`): ENQ wait, transmit/ACK, receive/ACK under one deadline
//! - **Multiplexer** (`queue`): FIFO of callers' requests, one exchange at a time
//! - **Worker** (`worker`): the task that owns the line and never dies of a bad exchange
//!
//! ## Example
//!
//! ```ignore
//! use std::time::Duration;
//! use visa1_link::{codec::RawPackager, transport::StreamTransport, Link};
//!
//! #[tokio::main]
//! async fn main() -> visa1_link::Result<()> {
//!     let link = Link::builder(RawPackager)
//!         .wait_for_idle_tone(false)
//!         .start(StreamTransport::new(port));
//!
//!     let response = link
//!         .request(packed_request, Duration::from_secs(60))
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod error;
pub mod handshake;
pub mod protocol;
pub mod transport;

mod link;
mod queue;
mod worker;

pub use error::{LinkError, Result};
pub use handshake::{Exchange, ExchangeEvent, ExchangeLog, ExchangeOutcome, Handshake, LinkPhase};
pub use link::{
    Link, LinkBuilder, LinkConfig, DEFAULT_CHECKSUM_TIMEOUT, DEFAULT_ERROR_COOLDOWN,
    DEFAULT_IDLE_INTERVAL, DEFAULT_RESPONSE_TIMEOUT,
};
pub use queue::{RequestHandle, RequestState};
