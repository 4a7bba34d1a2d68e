//! Pool background tasks: opener, pruner, retirer
//!
//! Exactly one of each per pool. The opener is the only path that grows the
//! population; retirement paths are the only ones that shrink it. All three
//! shut down on the pool's broadcast signal.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info};

use crate::classify::classify;
use crate::connection::Entry;
use crate::constants::pool::AVAILABLE_POLL;
use crate::pool::PoolShared;

pub(super) fn spawn(shared: &Arc<PoolShared>, retire_rx: mpsc::UnboundedReceiver<Arc<Entry>>) {
    let opener = Arc::clone(shared);
    let opener_shutdown = shared.shutdown_subscribe();
    tokio::spawn(async move { open_new_connections(opener, opener_shutdown).await });

    let pruner = Arc::clone(shared);
    let pruner_shutdown = shared.shutdown_subscribe();
    tokio::spawn(async move { prune_expired_connections(pruner, pruner_shutdown).await });

    let retirer_shutdown = shared.shutdown_subscribe();
    tokio::spawn(async move { retire_connections(retire_rx, retirer_shutdown).await });
}

/// Opener: waits on the demand signal, then adds connections while there is
/// a deficit or the population is below the floor, up to the ceiling. Open
/// failures arm a growing backoff; the next success resets it.
async fn open_new_connections(shared: Arc<PoolShared>, mut shutdown: broadcast::Receiver<()>) {
    let config = Arc::clone(&shared.config);
    let mut last_failure: Option<Instant> = None;
    let mut backoff = Duration::ZERO;

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            permit = shared.demand.acquire() => match permit {
                Ok(permit) => permit.forget(),
                Err(_) => break,
            },
        }

        while (shared.supply.load(Ordering::SeqCst) < 0
            || shared.total.load(Ordering::SeqCst) < config.minimum_connections)
            && shared.total.load(Ordering::SeqCst) < config.maximum_connections
        {
            if shared.is_closed() {
                return;
            }

            if let Some(failed_at) = last_failure {
                let remaining = backoff.saturating_sub(failed_at.elapsed());
                if !remaining.is_zero() {
                    debug!(
                        seconds = remaining.as_secs_f64(),
                        "backing off before next open attempt"
                    );
                    tokio::select! {
                        _ = shutdown.recv() => return,
                        _ = sleep(remaining) => {}
                    }
                    continue;
                }
            }

            let entry = Arc::new(Entry::new(
                shared.next_entry_id(),
                Arc::clone(&shared.config),
            ));
            let open_result = entry
                .open(
                    shared.driver.as_ref(),
                    shared.session_controller.as_deref(),
                    &shared.time_delta,
                )
                .await;

            match open_result {
                Ok(()) => {
                    shared.total.fetch_add(1, Ordering::SeqCst);
                    shared.supply.fetch_add(1, Ordering::SeqCst);
                    shared.push_available(entry);
                    last_failure = None;
                    backoff = Duration::ZERO;
                }
                Err(e) => {
                    error!(
                        error = %e,
                        disposition = %classify(&e),
                        "failed to open connection"
                    );
                    backoff = next_backoff(
                        backoff,
                        config.backoff_period,
                        config.backoff_multiplier,
                        config.backoff_limit,
                    );
                    last_failure = Some(Instant::now());
                }
            }
        }
    }
}

/// Compute the backoff after a failed open: the base period on the first
/// failure, then the previous backoff grown by the multiplier and clamped to
/// the limit (a zero limit leaves it unclamped).
fn next_backoff(current: Duration, base: Duration, multiplier: f64, limit: Duration) -> Duration {
    if current.is_zero() {
        return base;
    }
    let grown = current.mul_f64(multiplier.max(0.0));
    if limit.is_zero() { grown } else { grown.min(limit) }
}

/// Pruner: on each tick past the inactivity dwell, shrink the population
/// toward `max(minimum, high-water mark of the window)` by retiring idle
/// connections, then start a new observation window.
async fn prune_expired_connections(shared: Arc<PoolShared>, mut shutdown: broadcast::Receiver<()>) {
    let config = Arc::clone(&shared.config);
    if config.inactivity_timeout.is_zero() || config.prune_interval.is_zero() {
        return;
    }

    let mut last_prune = Instant::now();

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = sleep(config.prune_interval) => {}
        }

        if last_prune.elapsed() > config.inactivity_timeout {
            last_prune = Instant::now();

            let floor = config
                .minimum_connections
                .max(shared.ceiling.load(Ordering::SeqCst));

            while shared.total.load(Ordering::SeqCst) > floor {
                let Some(entry) = shared.take_available_within(AVAILABLE_POLL).await else {
                    break;
                };
                debug!(
                    connection = %entry.descriptor(),
                    "connection has expired and is being retired"
                );
                shared.supply.fetch_sub(1, Ordering::SeqCst);
                shared.total.fetch_sub(1, Ordering::SeqCst);
                shared.retire(entry);
            }

            shared.ceiling.store(0, Ordering::SeqCst);
        }
    }
}

/// Retirer: closes discarded connections with best-effort error swallowing.
/// On shutdown it drains whatever is already queued, then exits.
async fn retire_connections(
    mut retire_rx: mpsc::UnboundedReceiver<Arc<Entry>>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            entry = retire_rx.recv() => match entry {
                Some(entry) => entry.close().await,
                None => break,
            },
            _ = shutdown.recv() => {
                while let Ok(entry) = retire_rx.try_recv() {
                    entry.close().await;
                }
                break;
            }
        }
    }

    info!("retirer task stopped");
}
