//! Request multiplexer.
//!
//! Any number of callers queue work; the single link worker pops one item
//! at a time, drives it through the handshake and hands the outcome back
//! to whoever is waiting on it.
//!
//! ```text
//! Caller 1 ─┐                                          ┌─► oneshot ─► Caller 1
//! Caller 2 ─┼─► LinkQueue (FIFO) ─► process_next ─► Handshake
//! Caller N ─┘                                          └─► oneshot ─► Caller N
//! ```
//!
//! The queue and the in-flight flag live under one mutex. The mutex is
//! never held across an `.await`.

use std::any::Any;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;

use crate::codec::Packager;
use crate::error::{LinkError, Result};
use crate::handshake::Handshake;
use crate::link::LinkConfig;
use crate::transport::{Connectivity, LinkTransport};

/// Progress of one queued request, shared between caller and worker.
#[derive(Debug)]
pub struct RequestState {
    expires_at: Instant,
    abandoned: AtomicBool,
    transmitted_at: OnceLock<Instant>,
    completed_at: OnceLock<Instant>,
}

impl RequestState {
    fn new(expires_at: Instant) -> Self {
        Self {
            expires_at,
            abandoned: AtomicBool::new(false),
            transmitted_at: OnceLock::new(),
            completed_at: OnceLock::new(),
        }
    }

    /// Absolute expiry of the request.
    #[inline]
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Whether the request may no longer be transmitted.
    ///
    /// True once the expiry has passed or the caller stopped waiting.
    pub fn is_expired(&self) -> bool {
        self.abandoned.load(Ordering::Acquire) || Instant::now() >= self.expires_at
    }

    /// Whether the worker started transmitting this request.
    #[inline]
    pub fn is_transmitted(&self) -> bool {
        self.transmitted_at.get().is_some()
    }

    /// When the worker started transmitting this request.
    #[inline]
    pub fn transmitted_at(&self) -> Option<Instant> {
        self.transmitted_at.get().copied()
    }

    /// When the worker finished with this request.
    #[inline]
    pub fn completed_at(&self) -> Option<Instant> {
        self.completed_at.get().copied()
    }

    fn abandon(&self) {
        self.abandoned.store(true, Ordering::Release);
    }

    fn mark_transmitted(&self) {
        let _ = self.transmitted_at.set(Instant::now());
    }

    fn mark_completed(&self) {
        let _ = self.completed_at.set(Instant::now());
    }
}

/// A request whose caller is waiting for the response.
pub(crate) struct LinkRequest<M> {
    message: M,
    state: Arc<RequestState>,
    reply: oneshot::Sender<Result<M>>,
}

impl<M> LinkRequest<M> {
    /// Create a request and the handle its caller waits on.
    pub(crate) fn new(message: M, expires_at: Instant) -> (Self, RequestHandle<M>) {
        let state = Arc::new(RequestState::new(expires_at));
        let (reply, rx) = oneshot::channel();
        let request = Self {
            message,
            state: state.clone(),
            reply,
        };
        (request, RequestHandle { state, reply: rx })
    }

    /// Fill the response slot, releasing the caller.
    fn complete(self, result: Result<M>) {
        self.state.mark_completed();
        // The caller may have given up already
        let _ = self.reply.send(result);
    }
}

/// An item waiting for the link.
pub(crate) enum Outbound<M> {
    /// A caller is waiting for the response.
    Request(LinkRequest<M>),
    /// Fire-and-forget; any response is discarded.
    Message(M),
}

/// Caller side of a queued request.
pub struct RequestHandle<M> {
    state: Arc<RequestState>,
    reply: oneshot::Receiver<Result<M>>,
}

impl<M> RequestHandle<M> {
    /// Shared progress of this request.
    pub fn state(&self) -> Arc<RequestState> {
        self.state.clone()
    }

    /// Whether the worker started transmitting this request.
    #[inline]
    pub fn is_transmitted(&self) -> bool {
        self.state.is_transmitted()
    }

    /// Wait for the response, for at most `timeout`.
    ///
    /// The bound is independent of the link's own response timeout. On
    /// timeout the request is abandoned, so it is never transmitted if it
    /// is still queued.
    pub async fn response(self, timeout: Duration) -> Result<M> {
        match tokio::time::timeout(timeout, self.reply).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(LinkError::LinkClosed),
            Err(_) => {
                self.state.abandon();
                Err(LinkError::Timeout)
            }
        }
    }

    /// Wait for the response until the request's own expiry.
    pub async fn wait(self) -> Result<M> {
        let timeout = self.state.expires_at.saturating_duration_since(Instant::now());
        self.response(timeout).await
    }
}

struct QueueState<M> {
    items: VecDeque<Outbound<M>>,
    in_flight: bool,
}

/// FIFO of pending work plus the worker's wake-up signal.
pub(crate) struct LinkQueue<M> {
    state: Mutex<QueueState<M>>,
    wakeup: Notify,
}

impl<M> LinkQueue<M> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                in_flight: false,
            }),
            wakeup: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<M>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append to the tail and wake the worker. Never blocks on the link.
    pub(crate) fn push(&self, item: Outbound<M>) {
        self.lock().items.push_back(item);
        self.wakeup.notify_one();
    }

    /// Take the oldest item and mark the link busy.
    fn pop(&self) -> Option<Outbound<M>> {
        let mut state = self.lock();
        let item = state.items.pop_front();
        if item.is_some() {
            state.in_flight = true;
        }
        item
    }

    fn finish(&self) {
        self.lock().in_flight = false;
    }

    /// Number of items waiting (not counting one in flight).
    pub(crate) fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// Whether an item is being driven through the handshake right now.
    pub(crate) fn is_busy(&self) -> bool {
        self.lock().in_flight
    }

    /// Remove every expired request, answering each with
    /// [`LinkError::Expired`]. Returns how many were removed.
    ///
    /// Fire-and-forget messages carry no expiry and are kept.
    pub(crate) fn drop_expired(&self) -> usize {
        let expired: Vec<LinkRequest<M>> = {
            let mut state = self.lock();
            let mut kept = VecDeque::with_capacity(state.items.len());
            let mut expired = Vec::new();
            for item in state.items.drain(..) {
                match item {
                    Outbound::Request(request) if request.state.is_expired() => {
                        expired.push(request)
                    }
                    other => kept.push_back(other),
                }
            }
            state.items = kept;
            expired
        };

        let dropped = expired.len();
        for request in expired {
            request.complete(Err(LinkError::Expired));
        }
        dropped
    }

    /// Wake the worker without queueing anything.
    pub(crate) fn wake(&self) {
        self.wakeup.notify_one();
    }

    /// Suspend until woken or `max` elapses.
    pub(crate) async fn wait_for_work(&self, max: Duration) {
        let _ = tokio::time::timeout(max, self.wakeup.notified()).await;
    }
}

/// Clears the in-flight flag however processing ends.
struct InFlight<'a, M>(&'a LinkQueue<M>);

impl<M> Drop for InFlight<'_, M> {
    fn drop(&mut self) {
        self.0.finish();
    }
}

/// Pop the oldest item and drive it through one exchange.
///
/// The item leaves the queue whatever happens. A waiting caller always
/// gets an outcome; transport and codec faults, and panics raised by a
/// packager or transport, are additionally returned so the worker can log
/// them and cool down.
pub(crate) async fn process_next<T, C, P>(
    queue: &LinkQueue<P::Message>,
    transport: &mut T,
    connectivity: &C,
    packager: &P,
    config: &LinkConfig,
) -> Result<()>
where
    T: LinkTransport,
    C: Connectivity,
    P: Packager,
{
    let Some(item) = queue.pop() else {
        return Ok(());
    };
    let _in_flight = InFlight(queue);

    match item {
        Outbound::Message(message) => {
            guarded(async {
                let payload = packager.pack(&message)?;
                Handshake::new(transport, connectivity, config)
                    .run(&payload)
                    .await?;
                Ok::<(), LinkError>(())
            })
            .await
        }
        Outbound::Request(request) => {
            if request.state.is_expired() {
                tracing::warn!("Dropping expired request before transmission");
                request.complete(Err(LinkError::Expired));
                return Ok(());
            }
            request.state.mark_transmitted();

            let exchange = transceive(&request.message, transport, connectivity, packager, config);
            match guarded(exchange).await {
                Ok(Some(response)) => {
                    request.complete(Ok(response));
                    Ok(())
                }
                Ok(None) => {
                    request.complete(Err(LinkError::NoResponse));
                    Ok(())
                }
                Err(e) => {
                    request.complete(Err(LinkError::NoResponse));
                    Err(e)
                }
            }
        }
    }
}

/// Await `fut`, turning a panic inside it into [`LinkError::Panicked`].
pub(crate) async fn guarded<F, R>(fut: F) -> Result<R>
where
    F: Future<Output = Result<R>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(LinkError::Panicked(panic_message(panic.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

async fn transceive<T, C, P>(
    message: &P::Message,
    transport: &mut T,
    connectivity: &C,
    packager: &P,
    config: &LinkConfig,
) -> Result<Option<P::Message>>
where
    T: LinkTransport,
    C: Connectivity,
    P: Packager,
{
    let payload = packager.pack(message)?;
    let exchange = Handshake::new(transport, connectivity, config)
        .run(&payload)
        .await?;
    exchange
        .response
        .map(|bytes| packager.unpack(&bytes))
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RawPackager;
    use crate::protocol::control::{ACK, ACK_TERMINATORS, ETX, NAK};
    use crate::protocol::{compute_checksum, Frame};
    use crate::transport::LinkStatus;
    use bytes::Bytes;

    /// Host that ACKs every frame and answers with the request reversed.
    #[derive(Default)]
    struct ReversingHost {
        nak: bool,
        frames: Vec<Vec<u8>>,
        reply: Vec<u8>,
    }

    impl LinkTransport for ReversingHost {
        async fn send(&mut self, data: &[u8]) -> Result<()> {
            if let Some(frame) = Frame::decode(data) {
                self.reply = frame.payload().iter().rev().copied().collect();
                self.frames.push(data.to_vec());
            }
            Ok(())
        }

        async fn flush_outgoing(&mut self) -> Result<()> {
            Ok(())
        }

        async fn flush_incoming(&mut self) -> Result<()> {
            Ok(())
        }

        async fn read_until(
            &mut self,
            terminators: &[u8],
            _timeout: Duration,
            _include_terminator: bool,
        ) -> Result<Vec<u8>> {
            if terminators == ACK_TERMINATORS {
                return Ok(vec![if self.nak { NAK } else { ACK }]);
            }
            let mut body = self.reply.clone();
            body.push(ETX);
            Ok(body)
        }

        async fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
            buf[0] = compute_checksum(&self.reply);
            Ok(1)
        }
    }

    fn config() -> LinkConfig {
        LinkConfig {
            response_timeout: Duration::from_millis(500),
            wait_for_idle_tone: false,
            ..LinkConfig::default()
        }
    }

    fn expiring_in(ms: u64) -> Instant {
        Instant::now() + Duration::from_millis(ms)
    }

    #[tokio::test]
    async fn test_process_next_delivers_response() {
        let queue = LinkQueue::new();
        let mut host = ReversingHost::default();
        let status = LinkStatus::new(true);

        let (request, handle) = LinkRequest::new(Bytes::from_static(b"0100"), expiring_in(5000));
        queue.push(Outbound::Request(request));

        process_next(&queue, &mut host, &status, &RawPackager, &config())
            .await
            .unwrap();

        assert!(queue.is_empty());
        assert!(!queue.is_busy());
        assert!(handle.is_transmitted());
        let response = handle.response(Duration::from_secs(1)).await.unwrap();
        assert_eq!(response, Bytes::from_static(b"0010"));
    }

    #[tokio::test]
    async fn test_process_next_fifo() {
        let queue = LinkQueue::new();
        let mut host = ReversingHost::default();
        let status = LinkStatus::new(true);

        let mut handles = Vec::new();
        for payload in [&b"R1"[..], b"R2", b"R3"] {
            let (request, handle) =
                LinkRequest::new(Bytes::copy_from_slice(payload), expiring_in(5000));
            queue.push(Outbound::Request(request));
            handles.push(handle);
        }
        assert_eq!(queue.len(), 3);

        for _ in 0..3 {
            process_next(&queue, &mut host, &status, &RawPackager, &config())
                .await
                .unwrap();
        }

        let sent: Vec<Bytes> = host
            .frames
            .iter()
            .map(|f| Frame::decode(f).unwrap().into_payload())
            .collect();
        assert_eq!(sent, vec!["R1", "R2", "R3"]);

        let times: Vec<_> = handles
            .iter()
            .map(|h| h.state().transmitted_at().unwrap())
            .collect();
        assert!(times[0] <= times[1] && times[1] <= times[2]);
        // Single flight: each starts only after the previous one completed
        for pair in handles.windows(2) {
            let done = pair[0].state().completed_at().unwrap();
            assert!(pair[1].state().transmitted_at().unwrap() >= done);
        }
    }

    #[tokio::test]
    async fn test_expired_request_never_transmitted() {
        let queue = LinkQueue::new();
        let mut host = ReversingHost::default();
        let status = LinkStatus::new(true);

        let past = Instant::now() - Duration::from_secs(1);
        let (request, handle) = LinkRequest::new(Bytes::from_static(b"0100"), past);
        queue.push(Outbound::Request(request));

        process_next(&queue, &mut host, &status, &RawPackager, &config())
            .await
            .unwrap();

        assert!(host.frames.is_empty());
        assert!(queue.is_empty());
        assert!(!handle.is_transmitted());
        let result = handle.response(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(LinkError::Expired)));
    }

    #[tokio::test]
    async fn test_nak_yields_no_response_and_removes_entry() {
        let queue = LinkQueue::new();
        let mut host = ReversingHost {
            nak: true,
            ..Default::default()
        };
        let status = LinkStatus::new(true);

        let (request, handle) = LinkRequest::new(Bytes::from_static(b"0100"), expiring_in(5000));
        queue.push(Outbound::Request(request));

        process_next(&queue, &mut host, &status, &RawPackager, &config())
            .await
            .unwrap();

        assert!(queue.is_empty());
        let result = handle.response(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(LinkError::NoResponse)));
    }

    #[tokio::test]
    async fn test_fire_and_forget_message_transmitted() {
        let queue = LinkQueue::new();
        let mut host = ReversingHost::default();
        let status = LinkStatus::new(true);

        queue.push(Outbound::Message(Bytes::from_static(b"0400")));
        process_next(&queue, &mut host, &status, &RawPackager, &config())
            .await
            .unwrap();

        assert_eq!(host.frames.len(), 1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_empty_queue_is_noop() {
        let queue: LinkQueue<Bytes> = LinkQueue::new();
        let mut host = ReversingHost::default();
        let status = LinkStatus::new(true);

        process_next(&queue, &mut host, &status, &RawPackager, &config())
            .await
            .unwrap();
        assert!(host.frames.is_empty());
        assert!(!queue.is_busy());
    }

    #[tokio::test]
    async fn test_abandoned_request_is_dropped() {
        let queue = LinkQueue::new();
        let mut host = ReversingHost::default();
        let status = LinkStatus::new(true);

        let (request, handle) = LinkRequest::new(Bytes::from_static(b"0100"), expiring_in(60_000));
        let state = handle.state();
        queue.push(Outbound::Request(request));

        // Caller gives up before the worker gets to it
        let result = handle.response(Duration::from_millis(10)).await;
        assert!(matches!(result, Err(LinkError::Timeout)));
        assert!(state.is_expired());

        process_next(&queue, &mut host, &status, &RawPackager, &config())
            .await
            .unwrap();
        assert!(host.frames.is_empty());
        assert!(!state.is_transmitted());
    }

    #[tokio::test]
    async fn test_handle_reports_link_closed() {
        let (request, handle) = LinkRequest::new(Bytes::new(), expiring_in(5000));
        drop(request);

        let result = handle.response(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(LinkError::LinkClosed)));
    }

    #[tokio::test]
    async fn test_push_wakes_waiting_worker() {
        let queue = Arc::new(LinkQueue::new());
        let waiter = queue.clone();
        let started = Instant::now();

        let task = tokio::spawn(async move {
            waiter.wait_for_work(Duration::from_secs(10)).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(Outbound::Message(Bytes::from_static(b"0800")));
        task.await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_drop_expired_keeps_live_items() {
        let queue = LinkQueue::new();

        let past = Instant::now() - Duration::from_secs(1);
        let (stale, stale_handle) = LinkRequest::new(Bytes::from_static(b"STALE"), past);
        let (fresh, fresh_handle) = LinkRequest::new(Bytes::from_static(b"FRESH"), expiring_in(5000));
        queue.push(Outbound::Request(stale));
        queue.push(Outbound::Message(Bytes::from_static(b"0400")));
        queue.push(Outbound::Request(fresh));

        assert_eq!(queue.drop_expired(), 1);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.drop_expired(), 0);

        let result = stale_handle.response(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(LinkError::Expired)));
        assert!(!fresh_handle.is_transmitted());
    }

    /// Packager that panics instead of reporting a format error.
    struct PanickingPackager;

    impl Packager for PanickingPackager {
        type Message = Bytes;

        fn pack(&self, _message: &Bytes) -> Result<Bytes> {
            panic!("bitmap field 128 missing")
        }

        fn unpack(&self, payload: &[u8]) -> Result<Bytes> {
            Ok(Bytes::copy_from_slice(payload))
        }
    }

    #[tokio::test]
    async fn test_panicking_packager_answers_caller() {
        let queue = LinkQueue::new();
        let mut host = ReversingHost::default();
        let status = LinkStatus::new(true);

        let (request, handle) = LinkRequest::new(Bytes::from_static(b"0100"), expiring_in(5000));
        queue.push(Outbound::Request(request));

        let result = process_next(&queue, &mut host, &status, &PanickingPackager, &config()).await;

        match result {
            Err(LinkError::Panicked(msg)) => assert!(msg.contains("bitmap field 128")),
            other => panic!("expected a caught panic, got {:?}", other),
        }
        assert!(queue.is_empty());
        assert!(!queue.is_busy());
        let response = handle.response(Duration::from_secs(1)).await;
        assert!(matches!(response, Err(LinkError::NoResponse)));
    }

    #[tokio::test]
    async fn test_guarded_passes_results_through() {
        fn overrun() -> Result<()> {
            panic!("{} bytes past the buffer", 3)
        }

        let ok = guarded(async { Ok::<_, LinkError>(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        let err = guarded(async { Err::<(), _>(LinkError::NoResponse) }).await;
        assert!(matches!(err, Err(LinkError::NoResponse)));

        // Formatted panics carry a String payload
        let panicked = guarded(async { overrun() }).await;
        assert!(matches!(panicked, Err(LinkError::Panicked(msg)) if msg == "3 bytes past the buffer"));
    }
}
