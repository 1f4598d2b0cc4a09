//! Loopback - a link talking to a simulated authorization host.
//!
//! This example demonstrates:
//! - Building a link with the fluent builder
//! - Bringing the carrier up after "dialing" and waking the worker
//! - Several callers sharing one half-duplex line
//! - The per-exchange log emitted through `tracing`
//!
//! # Running
//!
//! ```text
//! RUST_LOG=visa1_link=debug cargo run --example loopback
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{duplex, DuplexStream};
use tracing_subscriber::EnvFilter;
use visa1_link::codec::RawPackager;
use visa1_link::protocol::control::{ACK, ACK_TERMINATORS, ENQ, ETX, NAK, STX};
use visa1_link::protocol::{encode, verify};
use visa1_link::transport::{LinkStatus, LinkTransport, StreamTransport};
use visa1_link::Link;

/// Host side: idle tone, then ACK each frame and answer with an approval.
async fn run_host(io: DuplexStream) -> visa1_link::Result<()> {
    let mut line = StreamTransport::new(io);
    loop {
        line.send(&[ENQ]).await?;
        let mut frame = line
            .read_until(&[ETX], Duration::from_millis(250), false)
            .await?;
        if frame.first() != Some(&STX) {
            continue;
        }
        frame.remove(0);

        let mut lrc = [0u8; 1];
        line.read(&mut lrc, Duration::from_secs(2)).await?;
        if !verify(&frame, lrc[0]) {
            line.send(&[NAK]).await?;
            continue;
        }
        line.send(&[ACK]).await?;

        let mut response = b"0110".to_vec();
        response.extend_from_slice(&frame[4.min(frame.len())..]);
        response.extend_from_slice(b" APROBADO");
        line.send(&encode(&response)).await?;
        line.read_until(ACK_TERMINATORS, Duration::from_secs(2), true)
            .await?;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let (terminal, host) = duplex(1024);
    tokio::spawn(async move {
        if let Err(e) = run_host(host).await {
            eprintln!("host stopped: {}", e);
        }
    });

    let carrier = LinkStatus::new(false);
    let link = Arc::new(
        Link::builder(RawPackager)
            .connectivity(carrier.clone())
            .response_timeout(Duration::from_secs(10))
            .start(StreamTransport::new(terminal)),
    );

    // Queue work before the line is up; it waits for the carrier
    let mut callers = Vec::new();
    for stan in 1..=3 {
        let link = link.clone();
        callers.push(tokio::spawn(async move {
            let request = Bytes::from(format!("0100{:06}", stan));
            link.request(request, Duration::from_secs(30)).await
        }));
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    println!("dialing... {} requests pending", link.pending());
    carrier.set_connected(true);
    link.wake();

    for caller in callers {
        match caller.await? {
            Ok(response) => println!("response: {}", String::from_utf8_lossy(&response)),
            Err(e) => println!("failed: {} (retryable: {})", e, e.is_retryable()),
        }
    }

    Ok(())
}
