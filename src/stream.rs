//! Streaming event listener.
//!
//! Consumes the push channel from the exchange and funnels order and
//! balance updates into the shared core. The stream is treated as a
//! best-effort accelerator: on any disconnect the listener nudges the
//! polling loop for an immediate repair pass, then resubscribes with
//! exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::connector::ConnectorCore;
use crate::exchange::{StreamEvent, StreamSource};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

pub(crate) struct StreamListener {
    core: Arc<ConnectorCore>,
    source: Arc<dyn StreamSource>,
    poll_trigger: Arc<Notify>,
}

impl StreamListener {
    pub(crate) fn new(
        core: Arc<ConnectorCore>,
        source: Arc<dyn StreamSource>,
        poll_trigger: Arc<Notify>,
    ) -> Self {
        Self {
            core,
            source,
            poll_trigger,
        }
    }

    pub(crate) async fn run(self, mut stop: watch::Receiver<bool>) {
        let mut backoff = INITIAL_BACKOFF;

        'subscribe: loop {
            if *stop.borrow() {
                break;
            }

            let mut rx = match self.source.subscribe().await {
                Ok(rx) => {
                    info!("stream subscribed");
                    // Repair whatever happened while disconnected. The
                    // backoff is not reset yet: a source that accepts the
                    // subscription and drops it immediately must still
                    // back off, so the reset waits for a delivered event.
                    self.poll_trigger.notify_one();
                    rx
                }
                Err(e) => {
                    if e.is_fatal() {
                        error!(error = %e, "fatal transport error subscribing to stream");
                        self.core.initiate_shutdown();
                        return;
                    }
                    warn!(error = %e, backoff = ?backoff, "stream subscription failed, retrying");
                    tokio::select! {
                        _ = sleep(backoff) => {}
                        changed = stop.changed() => {
                            if changed.is_err() || *stop.borrow() {
                                return;
                            }
                        }
                    }
                    backoff = (backoff * 2).min(self.core.config.stream_reconnect_max_backoff);
                    continue;
                }
            };

            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Some(StreamEvent::Disconnected) | None => {
                            warn!(backoff = ?backoff, "stream disconnected, resubscribing");
                            self.poll_trigger.notify_one();
                            tokio::select! {
                                _ = sleep(backoff) => {}
                                changed = stop.changed() => {
                                    if changed.is_err() || *stop.borrow() {
                                        debug!("stream listener stopped");
                                        return;
                                    }
                                }
                            }
                            backoff = (backoff * 2)
                                .min(self.core.config.stream_reconnect_max_backoff);
                            continue 'subscribe;
                        }
                        Some(event) => {
                            backoff = INITIAL_BACKOFF;
                            self.handle_event(event).await;
                        }
                    },
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            debug!("stream listener stopped");
                            return;
                        }
                    }
                }
            }
        }
        debug!("stream listener stopped");
    }

    async fn handle_event(&self, event: StreamEvent) {
        match event {
            StreamEvent::OrderUpdate(snapshot) => self.core.apply_snapshot(snapshot).await,
            StreamEvent::BalanceUpdate {
                asset,
                total_delta,
                available_delta,
            } => {
                self.core
                    .apply_balance_delta(&asset, total_delta, available_delta)
                    .await;
            }
            // Handled by the read loop.
            StreamEvent::Disconnected => {}
        }
    }
}
