//! Transport module - the byte line and the carrier.
//!
//! The link engine consumes two collaborators:
//! - [`LinkTransport`]: raw byte I/O with time-bounded reads
//! - [`Connectivity`]: whether the carrier (modem, socket) is up
//!
//! [`StreamTransport`] adapts any tokio byte stream (serial port, TCP,
//! `tokio::io::duplex`) to [`LinkTransport`].

mod stream;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::error::Result;

pub use stream::StreamTransport;

/// Byte-level access to the physical line.
///
/// Only the link worker calls these methods, so implementations need no
/// internal locking. Timeouts are never negative; a zero timeout means
/// "return whatever is already available".
pub trait LinkTransport: Send + 'static {
    /// Write raw bytes.
    fn send(&mut self, data: &[u8]) -> impl Future<Output = Result<()>> + Send;

    /// Make sure written bytes have left the buffer.
    fn flush_outgoing(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Discard any unread input.
    fn flush_incoming(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Read until one of `terminators` is seen or `timeout` elapses.
    ///
    /// Returns whatever was read. A result that does not end in a
    /// terminator means the timeout hit first.
    fn read_until(
        &mut self,
        terminators: &[u8],
        timeout: Duration,
        include_terminator: bool,
    ) -> impl Future<Output = Result<Vec<u8>>> + Send;

    /// Read up to `buf.len()` bytes within `timeout`, returning the count.
    fn read(&mut self, buf: &mut [u8], timeout: Duration)
        -> impl Future<Output = Result<usize>> + Send;
}

/// How often the default [`Connectivity::disconnected`] re-checks the carrier.
pub const CARRIER_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Carrier status query.
pub trait Connectivity: Send + Sync + 'static {
    /// Whether the line is currently connected.
    fn is_connected(&self) -> bool;

    /// Resolves once the line is no longer connected.
    ///
    /// Pending line reads are raced against this, so an exchange ends as
    /// soon as the carrier drops instead of waiting out its deadline. The
    /// default polls [`Connectivity::is_connected`].
    fn disconnected(&self) -> impl Future<Output = ()> + Send {
        async move {
            while self.is_connected() {
                tokio::time::sleep(CARRIER_POLL_INTERVAL).await;
            }
        }
    }
}

/// Shared connected/disconnected flag.
///
/// Cheaply cloneable. The dialer side calls [`LinkStatus::set_connected`],
/// the link reads it.
#[derive(Debug, Clone)]
pub struct LinkStatus {
    connected: Arc<watch::Sender<bool>>,
}

impl LinkStatus {
    /// Create a status flag with the given initial state.
    pub fn new(connected: bool) -> Self {
        let (tx, _rx) = watch::channel(connected);
        Self {
            connected: Arc::new(tx),
        }
    }

    /// Update the carrier state.
    #[inline]
    pub fn set_connected(&self, connected: bool) {
        self.connected.send_replace(connected);
    }
}

impl Default for LinkStatus {
    fn default() -> Self {
        Self::new(false)
    }
}

impl Connectivity for LinkStatus {
    #[inline]
    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    async fn disconnected(&self) {
        let mut rx = self.connected.subscribe();
        // The sender lives as long as self, so this only returns on a drop
        let _ = rx.wait_for(|connected| !*connected).await;
    }
}
