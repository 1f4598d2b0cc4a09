//! Link handshake state machine.
//!
//! Moves one request across the line and collects exactly one response:
//!
//! ```text
//! WaitIdle ──ENQ──► TransmitAwaitAck ──ACK──► ReceiveAwaitPayload ──frame──► done
//!    │                  │ NAK / silence            │ bad LRC: NAK, keep reading
//!    └── deadline ──────┴──────────────────────────┴──► no response
//! ```
//!
//! All phases share one deadline, set when the exchange starts. The loop
//! also stops as soon as the carrier drops, including in the middle of a
//! pending read. Every pass through a phase is
//! recorded in an [`ExchangeLog`] with the time elapsed since the start of
//! the exchange, and the log is emitted once per exchange.

use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::time::Instant;

use crate::error::Result;
use crate::link::LinkConfig;
use crate::protocol::control::{
    self, ACK, ACK_TERMINATORS, ETX, FRAME_DELIMITERS, IDLE_TERMINATORS, IDLE_TONE, NAK, STX,
};
use crate::protocol::{encode, Frame};
use crate::transport::{Connectivity, LinkTransport};

/// Shortest capture (payload plus ETX) treated as a candidate frame.
const MIN_PACKET_LEN: usize = 3;

/// Phase of a single exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkPhase {
    /// Waiting for the host's idle tone (ENQ).
    WaitIdle,
    /// Frame sent, waiting for ACK or NAK.
    TransmitAwaitAck,
    /// Waiting for the host's response frame.
    ReceiveAwaitPayload,
}

/// How an exchange ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeOutcome {
    /// A response frame was accepted.
    Response,
    /// Still connected, but no response before the deadline or after a NAK.
    EndOfTransmission,
    /// The carrier dropped before a response was captured.
    Disconnected,
    /// A transport error aborted the exchange.
    Failed,
}

/// One entry in an exchange log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ExchangeEvent {
    /// A phase was entered, `elapsed_ms` after the exchange started.
    Phase { phase: LinkPhase, elapsed_ms: u64 },
    /// The full outgoing frame.
    Sent { frame: String },
    /// The host refused the frame.
    Nak { elapsed_ms: u64 },
    /// A received frame failed its LRC check.
    ChecksumMismatch {
        expected: u8,
        received: Option<u8>,
    },
    /// A receive-phase capture that was not a frame.
    Discarded { data: String },
    /// The exchange ended without a response while still connected.
    EndOfTransmission,
}

/// Structured record of one exchange.
#[derive(Debug, Clone, Serialize)]
pub struct ExchangeLog {
    events: Vec<ExchangeEvent>,
    outcome: Option<ExchangeOutcome>,
    elapsed_ms: u64,
}

impl ExchangeLog {
    fn new() -> Self {
        Self {
            events: Vec::new(),
            outcome: None,
            elapsed_ms: 0,
        }
    }

    fn push(&mut self, event: ExchangeEvent) {
        self.events.push(event);
    }

    fn phase(&mut self, phase: LinkPhase, elapsed: Duration) {
        tracing::debug!(?phase, elapsed_ms = millis(elapsed), "link phase");
        self.push(ExchangeEvent::Phase {
            phase,
            elapsed_ms: millis(elapsed),
        });
    }

    /// Recorded events, in order.
    pub fn events(&self) -> &[ExchangeEvent] {
        &self.events
    }

    /// Terminal outcome.
    pub fn outcome(&self) -> Option<ExchangeOutcome> {
        self.outcome
    }

    /// Total duration of the exchange in milliseconds.
    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed_ms
    }

    /// Phases entered, in order.
    pub fn phases(&self) -> Vec<LinkPhase> {
        self.events
            .iter()
            .filter_map(|e| match e {
                ExchangeEvent::Phase { phase, .. } => Some(*phase),
                _ => None,
            })
            .collect()
    }

    /// Render as a JSON document.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    fn emit(&self) {
        match self.to_json() {
            Ok(json) => tracing::info!(
                outcome = ?self.outcome,
                elapsed_ms = self.elapsed_ms,
                log = %json,
                "request"
            ),
            Err(e) => tracing::warn!("Could not render exchange log: {}", e),
        }
    }
}

/// Result of one exchange: the accepted payload, if any, and its log.
#[derive(Debug, Clone)]
pub struct Exchange {
    /// Response payload, `None` when the host did not answer validly.
    pub response: Option<Bytes>,
    /// What happened on the line.
    pub log: ExchangeLog,
}

/// What a single receive-phase read produced.
enum Received {
    /// A lone STX: the frame has only just started.
    StartOfText,
    /// Payload with a matching LRC.
    Accepted(Bytes),
    /// Anything else; answered with NAK.
    Rejected,
    /// The carrier dropped while reading; nothing to acknowledge.
    CarrierLost,
}

/// Drives one request through the handshake.
///
/// Borrows the transport for the duration of a single exchange.
pub struct Handshake<'a, T, C> {
    transport: &'a mut T,
    connectivity: &'a C,
    response_timeout: Duration,
    wait_for_idle_tone: bool,
    checksum_timeout: Duration,
}

impl<'a, T, C> Handshake<'a, T, C>
where
    T: LinkTransport,
    C: Connectivity,
{
    /// Prepare an exchange using a snapshot of `config`.
    pub fn new(transport: &'a mut T, connectivity: &'a C, config: &LinkConfig) -> Self {
        Self {
            transport,
            connectivity,
            response_timeout: config.response_timeout,
            wait_for_idle_tone: config.wait_for_idle_tone,
            checksum_timeout: config.checksum_timeout,
        }
    }

    /// Run the exchange with a deadline of now plus the response timeout.
    pub async fn run(self, request: &[u8]) -> Result<Exchange> {
        let deadline = Instant::now() + self.response_timeout;
        self.run_until(request, deadline).await
    }

    /// Run the exchange against an explicit deadline.
    ///
    /// A deadline already in the past ends the exchange immediately with
    /// no response.
    pub async fn run_until(mut self, request: &[u8], deadline: Instant) -> Result<Exchange> {
        let start = Instant::now();
        let mut log = ExchangeLog::new();

        let result = self.drive(request, start, deadline, &mut log).await;

        let outcome = match &result {
            Ok(Some(_)) => ExchangeOutcome::Response,
            Ok(None) if self.connectivity.is_connected() => {
                log.push(ExchangeEvent::EndOfTransmission);
                ExchangeOutcome::EndOfTransmission
            }
            Ok(None) => ExchangeOutcome::Disconnected,
            Err(_) => ExchangeOutcome::Failed,
        };
        log.outcome = Some(outcome);
        log.elapsed_ms = millis(start.elapsed());
        log.emit();

        result.map(|response| Exchange { response, log })
    }

    async fn drive(
        &mut self,
        request: &[u8],
        start: Instant,
        deadline: Instant,
        log: &mut ExchangeLog,
    ) -> Result<Option<Bytes>> {
        let mut phase = if self.wait_for_idle_tone {
            LinkPhase::WaitIdle
        } else {
            LinkPhase::TransmitAwaitAck
        };

        self.transport.flush_incoming().await?;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || !self.connectivity.is_connected() {
                return Ok(None);
            }
            log.phase(phase, start.elapsed());

            match phase {
                LinkPhase::WaitIdle => {
                    let buf = tokio::select! {
                        biased;
                        buf = self.transport.read_until(IDLE_TERMINATORS, remaining, true) => buf?,
                        _ = self.connectivity.disconnected() => return Ok(None),
                    };
                    if buf.last() == Some(&IDLE_TONE) {
                        phase = LinkPhase::TransmitAwaitAck;
                    }
                }
                LinkPhase::TransmitAwaitAck => {
                    self.send_frame(request, log).await?;
                    // Writing the frame on a slow line eats into the deadline
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    let buf = tokio::select! {
                        biased;
                        buf = self.transport.read_until(ACK_TERMINATORS, remaining, true) => buf?,
                        _ = self.connectivity.disconnected() => return Ok(None),
                    };
                    match buf.last() {
                        Some(&ACK) => phase = LinkPhase::ReceiveAwaitPayload,
                        Some(&NAK) => {
                            log.push(ExchangeEvent::Nak {
                                elapsed_ms: millis(start.elapsed()),
                            });
                            return Ok(None);
                        }
                        _ => return Ok(None),
                    }
                }
                LinkPhase::ReceiveAwaitPayload => match self.receive_packet(remaining, log).await? {
                    Received::StartOfText | Received::CarrierLost => {}
                    Received::Accepted(payload) => {
                        self.acknowledge(ACK).await?;
                        return Ok(Some(payload));
                    }
                    Received::Rejected => self.acknowledge(NAK).await?,
                },
            }
        }
    }

    /// Send the whole frame in a single write.
    async fn send_frame(&mut self, request: &[u8], log: &mut ExchangeLog) -> Result<()> {
        let frame = encode(request);
        self.transport.send(&frame).await?;
        self.transport.flush_outgoing().await?;
        log.push(ExchangeEvent::Sent {
            frame: control::dump(&frame),
        });
        Ok(())
    }

    async fn receive_packet(
        &mut self,
        timeout: Duration,
        log: &mut ExchangeLog,
    ) -> Result<Received> {
        let packet = tokio::select! {
            biased;
            packet = self.transport.read_until(FRAME_DELIMITERS, timeout, true) => packet?,
            _ = self.connectivity.disconnected() => return Ok(Received::CarrierLost),
        };

        match packet.last() {
            Some(&STX) => Ok(Received::StartOfText),
            Some(&ETX) if packet.len() >= MIN_PACKET_LEN => {
                let payload = Bytes::copy_from_slice(&packet[..packet.len() - 1]);
                let mut lrc = [0u8; 1];
                let n = self.transport.read(&mut lrc, self.checksum_timeout).await?;
                let received = (n == 1).then_some(lrc[0]);

                let frame = Frame::received(payload, lrc[0]);
                if received.is_some() && frame.is_valid() {
                    return Ok(Received::Accepted(frame.into_payload()));
                }

                let expected = Frame::new(frame.into_payload()).checksum();
                tracing::warn!(
                    "Checksum mismatch: expected {:#04x}, received {:?}",
                    expected,
                    received
                );
                log.push(ExchangeEvent::ChecksumMismatch { expected, received });
                Ok(Received::Rejected)
            }
            _ => {
                log.push(ExchangeEvent::Discarded {
                    data: control::dump(&packet),
                });
                Ok(Received::Rejected)
            }
        }
    }

    async fn acknowledge(&mut self, byte: u8) -> Result<()> {
        self.transport.send(&[byte]).await?;
        self.transport.flush_outgoing().await
    }
}

#[inline]
fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}
