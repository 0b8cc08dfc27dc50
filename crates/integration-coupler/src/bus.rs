//! Topic-based event bus for coupling lifecycle events
//!
//! Publishers never block: each publish snapshots the subscribers of the
//! topic and hands delivery to a spawned task. A subscriber whose queue stays
//! full for longer than the publish timeout loses that event, which is logged.
//! Events are advisory; consumers re-read cluster state before acting.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kube::ResourceExt;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use integration_common::crd::{Plug, Socket, When};

/// Default capacity of each subscriber queue
pub const DEFAULT_QUEUE_SIZE: usize = 99;

/// Default time a delivery waits on a full subscriber queue
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle topic an event is published on
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Topic {
    /// A plug or socket was first observed
    Created,
    /// A plug was coupled to a socket
    Coupled,
    /// An existing coupling changed
    Updated,
    /// A plug was decoupled from a socket
    Decoupled,
    /// A plug or socket is being deleted
    Deleted,
    /// A coupling pass failed after the pair was coupled
    Broken,
}

impl Topic {
    /// Topics handled asynchronously by the dispatcher
    pub const ADVISORY: [Topic; 3] = [Topic::Created, Topic::Deleted, Topic::Broken];

    /// Name used for apparatus endpoints and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Coupled => "coupled",
            Self::Updated => "updated",
            Self::Decoupled => "decoupled",
            Self::Deleted => "deleted",
            Self::Broken => "broken",
        }
    }

    /// Resource hook that runs for this topic
    pub fn hook(&self) -> When {
        match self {
            Self::Created => When::Created,
            Self::Coupled => When::Coupled,
            Self::Updated => When::Changed,
            Self::Decoupled => When::Decoupled,
            Self::Deleted => When::Deleted,
            Self::Broken => When::Broken,
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of a coupling an event or pass concerns
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Side {
    /// The consumer
    Plug,
    /// The provider
    Socket,
}

impl Side {
    /// Kind name of this side
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Plug => "Plug",
            Self::Socket => "Socket",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind())
    }
}

/// What changed to trigger an update
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Scope {
    /// Desired state changed (new generation)
    #[default]
    Full,
    /// Only the status of the other side changed
    Status,
}

/// A single plug or socket
#[derive(Clone, Debug)]
pub enum Subject {
    /// A plug
    Plug(Arc<Plug>),
    /// A socket
    Socket(Arc<Socket>),
}

impl Subject {
    /// Side the subject belongs to
    pub fn side(&self) -> Side {
        match self {
            Self::Plug(_) => Side::Plug,
            Self::Socket(_) => Side::Socket,
        }
    }

    /// `namespace/name` of the subject
    pub fn key(&self) -> String {
        match self {
            Self::Plug(p) => object_key(p.namespace(), &p.name_any()),
            Self::Socket(s) => object_key(s.namespace(), &s.name_any()),
        }
    }
}

/// Both sides of a coupling with their resolved config and results
#[derive(Clone, Debug)]
pub struct Coupling {
    /// Side whose handlers run for this event
    pub side: Side,
    /// What changed, for update events
    pub scope: Scope,
    /// The plug
    pub plug: Arc<Plug>,
    /// The socket, absent when it no longer exists
    pub socket: Option<Arc<Socket>>,
    /// Resolved plug config
    pub plug_config: BTreeMap<String, String>,
    /// Resolved socket config
    pub socket_config: BTreeMap<String, String>,
    /// Resolved plug result
    pub plug_result: BTreeMap<String, String>,
    /// Resolved socket result
    pub socket_result: BTreeMap<String, String>,
}

impl Coupling {
    /// The same coupling seen from the other side
    pub fn for_side(&self, side: Side) -> Self {
        Self {
            side,
            ..self.clone()
        }
    }

    /// `namespace/name` of the plug
    pub fn plug_key(&self) -> String {
        object_key(self.plug.namespace(), &self.plug.name_any())
    }
}

/// Typed lifecycle event
#[derive(Clone, Debug)]
pub enum CouplingEvent {
    /// First observation of a plug or socket
    Created(Subject),
    /// A plug or socket is being deleted
    Deleted(Subject),
    /// A plug was coupled
    Coupled(Arc<Coupling>),
    /// A coupling changed
    Updated(Arc<Coupling>),
    /// A plug was decoupled
    Decoupled(Arc<Coupling>),
    /// A coupling pass failed on a coupled pair
    Broken(Arc<Coupling>),
}

impl CouplingEvent {
    /// Topic this event is published on
    pub fn topic(&self) -> Topic {
        match self {
            Self::Created(_) => Topic::Created,
            Self::Deleted(_) => Topic::Deleted,
            Self::Coupled(_) => Topic::Coupled,
            Self::Updated(_) => Topic::Updated,
            Self::Decoupled(_) => Topic::Decoupled,
            Self::Broken(_) => Topic::Broken,
        }
    }

    /// Side whose handlers run for this event
    pub fn side(&self) -> Side {
        match self {
            Self::Created(s) | Self::Deleted(s) => s.side(),
            Self::Coupled(c) | Self::Updated(c) | Self::Decoupled(c) | Self::Broken(c) => c.side,
        }
    }

    /// Key of the object the event concerns, for logging
    pub fn key(&self) -> String {
        match self {
            Self::Created(s) | Self::Deleted(s) => s.key(),
            Self::Coupled(c) | Self::Updated(c) | Self::Decoupled(c) | Self::Broken(c) => {
                c.plug_key()
            }
        }
    }
}

fn object_key(namespace: Option<String>, name: &str) -> String {
    format!("{}/{}", namespace.unwrap_or_default(), name)
}

/// Publish/subscribe router with bounded per-subscriber queues
pub struct EventBus {
    subscribers: RwLock<HashMap<Topic, Vec<mpsc::Sender<CouplingEvent>>>>,
    closed: Arc<AtomicBool>,
    queue_size: usize,
    publish_timeout: Duration,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_SIZE)
    }
}

impl EventBus {
    /// Create a bus whose subscriber queues hold `queue_size` events
    pub fn new(queue_size: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            closed: Arc::new(AtomicBool::new(false)),
            queue_size: queue_size.max(1),
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }

    /// Set how long a delivery waits on a full queue before dropping the event
    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    /// Register a new bounded queue for a topic
    pub fn subscribe(&self, topic: Topic) -> mpsc::Receiver<CouplingEvent> {
        let (tx, rx) = mpsc::channel(self.queue_size);
        self.subscribe_with(topic, tx);
        rx
    }

    /// Register one bounded queue for several topics
    pub fn subscribe_many(&self, topics: &[Topic]) -> mpsc::Receiver<CouplingEvent> {
        let (tx, rx) = mpsc::channel(self.queue_size);
        for topic in topics {
            self.subscribe_with(*topic, tx.clone());
        }
        rx
    }

    /// Register an existing sender for a topic
    pub fn subscribe_with(&self, topic: Topic, sender: mpsc::Sender<CouplingEvent>) {
        self.subscribers.write().entry(topic).or_default().push(sender);
        debug!(topic = %topic, "subscribed to topic");
    }

    /// Number of subscribers registered for a topic
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.subscribers.read().get(&topic).map_or(0, Vec::len)
    }

    /// Publish an event without blocking
    ///
    /// Delivery runs on a spawned task and reaches every subscriber registered
    /// at the time of this call. The handle resolves to the number of queues
    /// the event was delivered to.
    pub fn publish(&self, event: CouplingEvent) -> JoinHandle<usize> {
        let topic = event.topic();
        let senders = self
            .subscribers
            .read()
            .get(&topic)
            .cloned()
            .unwrap_or_default();
        let closed = self.closed.clone();
        let timeout = self.publish_timeout;

        tokio::spawn(async move {
            let mut delivered = 0;
            for sender in senders {
                if closed.load(Ordering::SeqCst) {
                    trace!(topic = %topic, "bus closed, skipping delivery");
                    continue;
                }
                match sender.send_timeout(event.clone(), timeout).await {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                        warn!(
                            topic = %topic,
                            key = %event.key(),
                            timeout_ms = timeout.as_millis(),
                            "subscriber queue full, dropping event"
                        );
                    }
                    Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                        trace!(topic = %topic, "subscriber gone");
                    }
                }
            }
            delivered
        })
    }

    /// Suppress deliveries until [`EventBus::open`] is called
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Resume deliveries
    pub fn open(&self) {
        self.closed.store(false, Ordering::SeqCst);
    }

    /// Whether deliveries are suppressed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the bus and drop every subscription
    pub fn teardown(&self) {
        self.close();
        self.subscribers.write().clear();
        debug!("event bus torn down");
    }
}
