//! Dedicated link worker task.
//!
//! One task per link owns the transport exclusively and services the queue
//! forever:
//!
//! ```text
//! ┌──────────────┐  empty / carrier down   ┌────────────────────────┐
//! │ check queue  │ ──────────────────────► │ sleep until woken or   │
//! │ + carrier    │ ◄────────────────────── │ idle_interval elapses  │
//! └──────┬───────┘                         └────────────────────────┘
//!        │ work
//!        ▼
//! ┌──────────────┐  error / panic          ┌────────────────────────┐
//! │ process_next │ ──────────────────────► │ log, cool down         │
//! └──────────────┘                         └────────────────────────┘
//! ```
//!
//! A failed or panicking exchange never ends the loop. The task stops only
//! when the [`Link`](crate::Link) that spawned it is dropped.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::codec::Packager;
use crate::link::LinkShared;
use crate::queue::{guarded, process_next};
use crate::transport::{Connectivity, LinkTransport};

/// Spawn the worker that drives `transport` for the link in `shared`.
pub(crate) fn spawn_link_worker<T, C, P>(transport: T, shared: Arc<LinkShared<P, C>>) -> JoinHandle<()>
where
    T: LinkTransport,
    C: Connectivity,
    P: Packager,
{
    tokio::spawn(run(transport, shared))
}

async fn run<T, C, P>(mut transport: T, shared: Arc<LinkShared<P, C>>)
where
    T: LinkTransport,
    C: Connectivity,
    P: Packager,
{
    loop {
        // Re-read every round so setters apply to the next exchange
        let config = shared.config();
        let connected = shared.connectivity.is_connected();

        if !connected {
            // Nothing is popped while the carrier is down
            let dropped = shared.queue.drop_expired();
            if dropped > 0 {
                tracing::warn!(dropped, "Dropped expired requests while disconnected");
            }
        }

        if shared.queue.is_empty() || !connected {
            shared.queue.wait_for_work(config.idle_interval).await;
            continue;
        }

        let round = process_next(
            &shared.queue,
            &mut transport,
            &shared.connectivity,
            &shared.packager,
            &config,
        );
        if let Err(e) = guarded(round).await {
            tracing::error!("Link exchange failed: {}", e);
            tokio::time::sleep(config.error_cooldown).await;
        }
    }
}
