//! Link builder and public surface.
//!
//! The [`LinkBuilder`] provides a fluent API for configuring the link.
//! [`LinkBuilder::start`] hands the transport to a dedicated worker task
//! and returns the [`Link`] callers queue messages on.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use visa1_link::{codec::RawPackager, transport::{LinkStatus, StreamTransport}, Link};
//!
//! #[tokio::main]
//! async fn main() -> visa1_link::Result<()> {
//!     let carrier = LinkStatus::new(false);
//!     let link = Link::builder(RawPackager)
//!         .connectivity(carrier.clone())
//!         .wait_for_idle_tone(false)
//!         .response_timeout(Duration::from_secs(60))
//!         .start(StreamTransport::new(port));
//!
//!     // ... dial, then
//!     carrier.set_connected(true);
//!     link.wake();
//!
//!     let response = link.request(packed_auth, Duration::from_secs(60)).await?;
//!     Ok(())
//! }
//! ```

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::codec::Packager;
use crate::error::Result;
use crate::queue::{LinkQueue, LinkRequest, Outbound, RequestHandle};
use crate::transport::{Connectivity, LinkStatus, LinkTransport};
use crate::worker::spawn_link_worker;

/// Default per-exchange response timeout.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default time the worker sleeps between queue checks when idle.
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_secs(10);

/// Default pause after a failed exchange.
pub const DEFAULT_ERROR_COOLDOWN: Duration = Duration::from_secs(10);

/// Default wait for the LRC byte that follows ETX.
pub const DEFAULT_CHECKSUM_TIMEOUT: Duration = Duration::from_secs(2);

/// Link configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    /// Deadline shared by all phases of one exchange.
    pub response_timeout: Duration,
    /// Wait for the host's ENQ before transmitting.
    pub wait_for_idle_tone: bool,
    /// Upper bound on the worker's idle sleep.
    pub idle_interval: Duration,
    /// Pause after an exchange fails with an error.
    pub error_cooldown: Duration,
    /// Wait for the LRC byte after ETX.
    pub checksum_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            wait_for_idle_tone: true,
            idle_interval: DEFAULT_IDLE_INTERVAL,
            error_cooldown: DEFAULT_ERROR_COOLDOWN,
            checksum_timeout: DEFAULT_CHECKSUM_TIMEOUT,
        }
    }
}

/// State shared between the [`Link`] and its worker.
pub(crate) struct LinkShared<P: Packager, C> {
    pub(crate) queue: LinkQueue<P::Message>,
    pub(crate) connectivity: C,
    pub(crate) packager: P,
    config: RwLock<LinkConfig>,
}

impl<P: Packager, C> LinkShared<P, C> {
    /// Snapshot of the current configuration.
    pub(crate) fn config(&self) -> LinkConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update_config(&self, f: impl FnOnce(&mut LinkConfig)) {
        let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut config);
    }
}

/// Builder for configuring and starting a link.
pub struct LinkBuilder<P, C = LinkStatus> {
    packager: P,
    connectivity: C,
    config: LinkConfig,
}

impl<P: Packager> LinkBuilder<P, LinkStatus> {
    /// Create a builder. The carrier is assumed up until
    /// [`LinkBuilder::connectivity`] says otherwise.
    pub fn new(packager: P) -> Self {
        Self {
            packager,
            connectivity: LinkStatus::new(true),
            config: LinkConfig::default(),
        }
    }
}

impl<P: Packager, C: Connectivity> LinkBuilder<P, C> {
    /// Use `connectivity` to decide whether the line is up.
    pub fn connectivity<C2: Connectivity>(self, connectivity: C2) -> LinkBuilder<P, C2> {
        LinkBuilder {
            packager: self.packager,
            connectivity,
            config: self.config,
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: LinkConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the per-exchange response timeout.
    ///
    /// Default: 60 seconds
    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.config.response_timeout = timeout;
        self
    }

    /// Whether to wait for the host's idle tone before transmitting.
    ///
    /// Default: true
    pub fn wait_for_idle_tone(mut self, wait: bool) -> Self {
        self.config.wait_for_idle_tone = wait;
        self
    }

    /// Set the worker's idle re-check interval.
    ///
    /// Default: 10 seconds
    pub fn idle_interval(mut self, interval: Duration) -> Self {
        self.config.idle_interval = interval;
        self
    }

    /// Set the pause after a failed exchange.
    ///
    /// Default: 10 seconds
    pub fn error_cooldown(mut self, cooldown: Duration) -> Self {
        self.config.error_cooldown = cooldown;
        self
    }

    /// Set the wait for the LRC byte.
    ///
    /// Default: 2 seconds
    pub fn checksum_timeout(mut self, timeout: Duration) -> Self {
        self.config.checksum_timeout = timeout;
        self
    }

    /// Start the link worker on `transport`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<T: LinkTransport>(self, transport: T) -> Link<P, C> {
        let shared = Arc::new(LinkShared {
            queue: LinkQueue::new(),
            connectivity: self.connectivity,
            packager: self.packager,
            config: RwLock::new(self.config),
        });
        let worker = spawn_link_worker(transport, shared.clone());
        Link { shared, worker }
    }
}

/// A running link.
///
/// Share it behind an `Arc` to let many callers queue work concurrently.
/// Dropping the link stops its worker; requests still queued then resolve
/// to [`LinkError::LinkClosed`](crate::LinkError::LinkClosed).
pub struct Link<P: Packager, C = LinkStatus> {
    shared: Arc<LinkShared<P, C>>,
    worker: JoinHandle<()>,
}

impl<P: Packager> Link<P, LinkStatus> {
    /// Create a new link builder.
    pub fn builder(packager: P) -> LinkBuilder<P, LinkStatus> {
        LinkBuilder::new(packager)
    }
}

impl<P: Packager, C: Connectivity> Link<P, C> {
    /// Queue a request whose caller will wait for the response.
    ///
    /// The request expires `expires_in` from now; if it is still queued
    /// then, it is dropped without being transmitted.
    pub fn queue(&self, message: P::Message, expires_in: Duration) -> RequestHandle<P::Message> {
        let (request, handle) = LinkRequest::new(message, Instant::now() + expires_in);
        self.shared.queue.push(Outbound::Request(request));
        handle
    }

    /// Queue a request and wait up to `timeout` for its response.
    pub async fn request(&self, message: P::Message, timeout: Duration) -> Result<P::Message> {
        self.queue(message, timeout).response(timeout).await
    }

    /// Queue a message nobody waits for. Any response is discarded.
    pub fn send(&self, message: P::Message) {
        self.shared.queue.push(Outbound::Message(message));
    }

    /// Nudge the worker, e.g. right after the carrier comes up.
    pub fn wake(&self) {
        self.shared.queue.wake();
    }

    /// Set the per-exchange response timeout for subsequent exchanges.
    pub fn set_timeout(&self, timeout: Duration) {
        self.shared.update_config(|c| c.response_timeout = timeout);
    }

    /// Current per-exchange response timeout.
    pub fn timeout(&self) -> Duration {
        self.shared.config().response_timeout
    }

    /// Set whether subsequent exchanges wait for the idle tone.
    pub fn set_wait_for_idle_tone(&self, wait: bool) {
        self.shared.update_config(|c| c.wait_for_idle_tone = wait);
    }

    /// Whether exchanges wait for the idle tone.
    pub fn wait_for_idle_tone(&self) -> bool {
        self.shared.config().wait_for_idle_tone
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> LinkConfig {
        self.shared.config()
    }

    /// The carrier status collaborator.
    pub fn connectivity(&self) -> &C {
        &self.shared.connectivity
    }

    /// Number of queued items not yet picked up by the worker.
    pub fn pending(&self) -> usize {
        self.shared.queue.len()
    }

    /// Whether an exchange is on the line right now.
    pub fn is_busy(&self) -> bool {
        self.shared.queue.is_busy()
    }
}

impl<P: Packager, C> Drop for Link<P, C> {
    fn drop(&mut self) {
        self.worker.abort();
    }
}
