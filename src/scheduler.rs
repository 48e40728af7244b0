//! Outbound request scheduler.
//!
//! A bounded queue of request futures drained by a single consumer task,
//! so outbound writes preserve submission order and never exceed the
//! configured in-flight limit. A full queue blocks the submitter
//! (backpressure); requests are never dropped silently.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

type RequestFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// The scheduler has shut down; the request was not dispatched.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("request scheduler is shut down")]
pub struct SchedulerClosed;

/// Serialization point for outbound write requests.
pub struct RequestScheduler {
    tx: mpsc::Sender<RequestFuture>,
    rx: Mutex<Option<mpsc::Receiver<RequestFuture>>>,
    max_in_flight: usize,
}

impl RequestScheduler {
    #[must_use]
    pub fn new(queue_depth: usize, max_in_flight: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            max_in_flight: max_in_flight.max(1),
        }
    }

    /// Enqueue a request, waiting for queue space if necessary.
    ///
    /// Returns a handle resolved with the request's output once the
    /// consumer has run it; the handle may be dropped if the caller does
    /// not care about the result.
    pub async fn submit<T, F>(&self, request: F) -> Result<oneshot::Receiver<T>, SchedulerClosed>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let job: RequestFuture = Box::pin(async move {
            // The receiver may have been dropped; that is fine.
            let _ = done_tx.send(request.await);
        });
        self.tx.send(job).await.map_err(|_| SchedulerClosed)?;
        Ok(done_rx)
    }

    /// Drain the queue until the stop signal flips.
    ///
    /// Dispatch order follows submission order: a semaphore permit is
    /// acquired before each request is spawned, bounding concurrency at
    /// `max_in_flight` without reordering the queue.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        let Some(mut rx) = self.rx.lock().await.take() else {
            warn!("request scheduler started twice, ignoring");
            return;
        };
        let permits = Arc::new(Semaphore::new(self.max_in_flight));

        'drain: loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                job = rx.recv() => {
                    let Some(job) = job else { break };
                    // All permits may be held by hung requests; keep
                    // watching the stop signal while waiting for one.
                    let permit = loop {
                        tokio::select! {
                            permit = permits.clone().acquire_owned() => {
                                match permit {
                                    Ok(permit) => break permit,
                                    Err(_) => break 'drain,
                                }
                            }
                            changed = stop.changed() => {
                                if changed.is_err() || *stop.borrow() {
                                    break 'drain;
                                }
                            }
                        }
                    };
                    tokio::spawn(async move {
                        job.await;
                        drop(permit);
                    });
                }
            }
        }
        debug!("request scheduler stopped");
    }

    /// Spawn the consumer task.
    pub fn spawn(self: Arc<Self>, stop: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(stop).await })
    }
}
