//! Event-driven reconcile triggers. A pump task forwards container
//! lifecycle events into a depth-one channel: a burst of events while a
//! pass is pending coalesces into a single extra pass instead of a queue.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::runtime::DynContainerRuntime;
use crate::telemetry;

/// Buffer between the watcher task and the pump. Small on purpose; the
/// trigger side coalesces anyway.
const EVENT_QUEUE_DEPTH: usize = 32;

/// Depth-one channel: a pending trigger absorbs any number of new events.
pub fn trigger_channel() -> (mpsc::Sender<()>, mpsc::Receiver<()>) {
    mpsc::channel(1)
}

/// Runs the lifecycle watcher and converts its events into triggers until
/// shutdown. A dead stream is reconnected with jittered exponential backoff;
/// the backoff resets once a connection delivers an event.
pub async fn pump_events(
    runtime: DynContainerRuntime,
    triggers: mpsc::Sender<()>,
    mut shutdown: watch::Receiver<bool>,
    reconnect_base: Duration,
    reconnect_max: Duration,
) {
    let mut backoff = reconnect_base;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let (event_tx, mut event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let watcher_runtime = Arc::clone(&runtime);
        let watcher =
            tokio::spawn(async move { watcher_runtime.watch_lifecycle_events(event_tx).await });

        let mut delivered = false;
        let mut interrupted = false;
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        interrupted = true;
                        break;
                    }
                }
                maybe_event = event_rx.recv() => {
                    match maybe_event {
                        Some(event) => {
                            delivered = true;
                            telemetry::record_lifecycle_event(event.action.as_str());
                            debug!(
                                action = event.action.as_str(),
                                container = event.container_name.as_deref().unwrap_or(&event.container_id),
                                "container lifecycle event"
                            );
                            if triggers.try_send(()).is_err() {
                                debug!("reconcile already pending; coalescing event");
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        if interrupted {
            watcher.abort();
            let _ = watcher.await;
            break;
        }

        match watcher.await {
            Ok(Ok(())) => debug!("event stream ended"),
            Ok(Err(error)) => warn!(%error, "event stream failed"),
            Err(join_error) => warn!(%join_error, "event watcher panicked"),
        }

        telemetry::record_event_stream_restart();
        if delivered {
            backoff = reconnect_base;
        }
        let delay = with_jitter(backoff);
        debug!(delay_ms = delay.as_millis() as u64, "restarting event stream");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
        backoff = (backoff * 2).min(reconnect_max);
    }

    debug!("event pump stopped");
}

fn with_jitter(base: Duration) -> Duration {
    let factor = rand::rng().random_range(0.8..1.25);
    base.mul_f64(factor)
}
