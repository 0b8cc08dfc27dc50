//! Background dispatch of advisory lifecycle events
//!
//! `created`, `deleted` and `broken` do not gate a coupling pass, so the
//! coupler publishes them and this dispatcher runs their handlers with a
//! bounded number of concurrent workers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{CouplingEvent, EventBus, Topic, DEFAULT_QUEUE_SIZE};
use crate::handlers::LifecycleHandler;

/// Default number of concurrent handler runs
pub const DEFAULT_MAX_WORKERS: usize = 1;

/// Dispatcher sizing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Concurrent handler runs
    pub max_workers: usize,
    /// Capacity of the bus queues
    pub queue_size: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            queue_size: DEFAULT_QUEUE_SIZE,
        }
    }
}

/// Runs advisory event handlers off the bus
pub struct Dispatcher {
    bus: Arc<EventBus>,
    handler: Arc<dyn LifecycleHandler>,
    workers: Arc<Semaphore>,
    max_workers: usize,
    finished: AtomicBool,
}

impl Dispatcher {
    /// Create a dispatcher; at least one worker always runs
    pub fn new(bus: Arc<EventBus>, handler: Arc<dyn LifecycleHandler>, max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            bus,
            handler,
            workers: Arc::new(Semaphore::new(max_workers)),
            max_workers,
            finished: AtomicBool::new(false),
        }
    }

    /// Subscribe to the advisory topics and start dispatching
    ///
    /// The subscription exists when this returns, so events published
    /// afterwards are not missed. Cancelling `cancel` stops the loop, waits
    /// for in-flight handlers and tears the bus down.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let events = self.bus.subscribe_many(&Topic::ADVISORY);
        tokio::spawn(async move { self.run(events, cancel).await })
    }

    /// Whether the dispatcher has shut down
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    async fn run(&self, mut events: mpsc::Receiver<CouplingEvent>, cancel: CancellationToken) {
        info!(max_workers = self.max_workers, "event dispatcher started");

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = self.workers.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let handler = self.handler.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let topic = event.topic();
                debug!(event = %topic, key = %event.key(), "dispatching");
                if let Err(e) = handler.handle(&event).await {
                    warn!(event = %topic, key = %event.key(), error = %e, "lifecycle handler failed");
                }
            });
        }

        self.bus.teardown();
        // Every permit back means every worker finished
        if let Ok(permits) = self.workers.acquire_many(self.max_workers as u32).await {
            drop(permits);
        }
        self.finished.store(true, Ordering::SeqCst);
        info!("event dispatcher stopped");
    }
}
