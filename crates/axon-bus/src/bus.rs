//! The event bus and its subscribers.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use axon_clock::{Hlc, NodeId};
use serde::Serialize;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::inbox::{Inbox, PushOutcome};
use crate::{Event, Priority, Topic};

/// Identifier of a subscriber within one bus.
pub type SubscriberId = u64;

/// Configuration for an [`EventBus`].
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Ordinary-lane capacity of every subscriber inbox.
    pub subscriber_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: 1024,
        }
    }
}

impl BusConfig {
    /// Set the per-subscriber ordinary-lane capacity.
    #[must_use]
    pub fn with_subscriber_capacity(mut self, capacity: usize) -> Self {
        self.subscriber_capacity = capacity;
        self
    }
}

/// Point-in-time bus counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BusStats {
    /// Events published on any lane.
    pub published: u64,
    /// Events published on the algedonic lane.
    pub escalated: u64,
    /// Ordinary events shed by full inboxes.
    pub dropped: u64,
    /// Live subscribers.
    pub subscribers: usize,
    /// Subscriber count per topic.
    pub topics: BTreeMap<String, usize>,
}

#[derive(Debug, Default)]
struct Registry {
    topics: HashMap<Topic, BTreeMap<SubscriberId, Arc<Inbox>>>,
    inboxes: HashMap<SubscriberId, Arc<Inbox>>,
    closed: bool,
}

#[derive(Debug)]
struct BusInner {
    hlc: Arc<Hlc>,
    config: BusConfig,
    /// Delivery happens under this lock so every subscriber observes the
    /// same publish order.
    registry: Mutex<Registry>,
    next_id: AtomicU64,
    published: AtomicU64,
    escalated: AtomicU64,
    dropped: AtomicU64,
}

/// Topic-based publish/subscribe stamped by the node's HLC.
///
/// Cheap to clone; all clones share the same subscribers.
#[derive(Debug, Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a bus with default configuration.
    pub fn new(hlc: Arc<Hlc>) -> Self {
        Self::with_config(hlc, BusConfig::default())
    }

    pub fn with_config(hlc: Arc<Hlc>, config: BusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                hlc,
                config,
                registry: Mutex::new(Registry::default()),
                next_id: AtomicU64::new(1),
                published: AtomicU64::new(0),
                escalated: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// The clock stamping this bus's events.
    pub fn hlc(&self) -> &Arc<Hlc> {
        &self.inner.hlc
    }

    pub fn node_id(&self) -> &NodeId {
        self.inner.hlc.node_id()
    }

    /// Create a subscriber with no topics yet.
    pub fn subscriber(&self) -> Result<Subscriber> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let inbox = Arc::new(Inbox::new(self.inner.config.subscriber_capacity));
        {
            let mut registry = self.registry();
            if registry.closed {
                return Err(Error::Closed);
            }
            registry.inboxes.insert(id, Arc::clone(&inbox));
        }
        Ok(Subscriber {
            id,
            bus: self.clone(),
            inbox,
            topics: BTreeSet::new(),
        })
    }

    /// Create a subscriber listening on a single topic.
    pub fn subscribe(&self, topic: Topic) -> Result<Subscriber> {
        let mut subscriber = self.subscriber()?;
        subscriber.subscribe(topic)?;
        Ok(subscriber)
    }

    /// Publish an ordinary event, stamped with a fresh HLC timestamp.
    pub fn publish(&self, topic: Topic, payload: serde_json::Value) -> Arc<Event> {
        self.publish_with_priority(topic, payload, Priority::Ordinary).0
    }

    /// Publish any serializable payload as an ordinary event.
    pub fn publish_json<T: Serialize>(&self, topic: Topic, payload: &T) -> Result<Arc<Event>> {
        Ok(self.publish(topic, serde_json::to_value(payload)?))
    }

    /// Re-publish an event that originated on another node.
    ///
    /// The local clock is advanced past the event's stamp; the event keeps
    /// its original id, stamp and source.
    pub fn republish(&self, event: Event) -> Arc<Event> {
        let registry = self.registry();
        self.inner.hlc.update(&event.hlc);
        let event = Arc::new(event);
        self.deliver(&registry, Arc::clone(&event));
        event
    }

    /// Publish on the given lane; returns the event and how many inboxes
    /// accepted it.
    pub(crate) fn publish_with_priority(
        &self,
        topic: Topic,
        payload: serde_json::Value,
        priority: Priority,
    ) -> (Arc<Event>, usize) {
        // Stamp under the registry lock: inboxes receive events in HLC order.
        let registry = self.registry();
        let hlc = self.inner.hlc.now();
        let event = Arc::new(Event::new(topic, payload, hlc, priority));
        let delivered = self.deliver(&registry, Arc::clone(&event));
        (event, delivered)
    }

    fn deliver(&self, registry: &Registry, event: Arc<Event>) -> usize {
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        if event.is_algedonic() {
            self.inner.escalated.fetch_add(1, Ordering::Relaxed);
        }

        let Some(inboxes) = registry.topics.get(&event.topic) else {
            trace!(topic = %event.topic, id = %event.id, "published with no subscribers");
            return 0;
        };

        let mut delivered = 0;
        for (subscriber, inbox) in inboxes {
            match inbox.push(Arc::clone(&event)) {
                PushOutcome::Queued => delivered += 1,
                PushOutcome::DroppedOldest => {
                    delivered += 1;
                    self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(subscriber, topic = %event.topic, "inbox full, dropped oldest ordinary event");
                }
                PushOutcome::Closed => {}
            }
        }
        trace!(topic = %event.topic, id = %event.id, delivered, "published");
        delivered
    }

    /// Number of subscribers currently listening on `topic`.
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.registry().topics.get(topic).map_or(0, BTreeMap::len)
    }

    pub fn stats(&self) -> BusStats {
        let registry = self.registry();
        BusStats {
            published: self.inner.published.load(Ordering::Relaxed),
            escalated: self.inner.escalated.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
            subscribers: registry.inboxes.len(),
            topics: registry
                .topics
                .iter()
                .map(|(topic, subs)| (topic.to_string(), subs.len()))
                .collect(),
        }
    }

    /// Close the bus: subscribers drain what is queued and then see `None`.
    pub fn close(&self) {
        let mut registry = self.registry();
        registry.closed = true;
        for inbox in registry.inboxes.values() {
            inbox.close();
        }
    }

    fn attach(&self, id: SubscriberId, topic: Topic, inbox: &Arc<Inbox>) -> Result<()> {
        topic.validate()?;
        let mut registry = self.registry();
        if registry.closed {
            return Err(Error::Closed);
        }
        registry
            .topics
            .entry(topic)
            .or_default()
            .insert(id, Arc::clone(inbox));
        Ok(())
    }

    fn detach(&self, id: SubscriberId, topic: &Topic) {
        let mut registry = self.registry();
        if let Some(subs) = registry.topics.get_mut(topic) {
            subs.remove(&id);
            if subs.is_empty() {
                registry.topics.remove(topic);
            }
        }
    }

    fn remove_subscriber(&self, id: SubscriberId, topics: &BTreeSet<Topic>) {
        for topic in topics {
            self.detach(id, topic);
        }
        self.registry().inboxes.remove(&id);
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A consumer of bus events with its own bounded inbox.
///
/// Dropping the subscriber unsubscribes it from every topic.
#[derive(Debug)]
pub struct Subscriber {
    id: SubscriberId,
    bus: EventBus,
    inbox: Arc<Inbox>,
    topics: BTreeSet<Topic>,
}

impl Subscriber {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Start receiving events published on `topic`.
    pub fn subscribe(&mut self, topic: Topic) -> Result<()> {
        if self.topics.contains(&topic) {
            return Ok(());
        }
        self.bus.attach(self.id, topic.clone(), &self.inbox)?;
        debug!(subscriber = self.id, %topic, "subscribed");
        self.topics.insert(topic);
        Ok(())
    }

    /// Stop receiving events on `topic`. Returns whether it was subscribed.
    /// Events already queued stay in the inbox.
    pub fn unsubscribe(&mut self, topic: &Topic) -> bool {
        if !self.topics.remove(topic) {
            return false;
        }
        self.bus.detach(self.id, topic);
        debug!(subscriber = self.id, %topic, "unsubscribed");
        true
    }

    pub fn topics(&self) -> impl Iterator<Item = &Topic> {
        self.topics.iter()
    }

    /// Wait for the next event; algedonic events come first.
    ///
    /// Returns `None` after the bus is closed and the inbox is drained.
    pub async fn recv(&self) -> Option<Arc<Event>> {
        self.inbox.pop().await
    }

    pub fn try_recv(&self) -> Option<Arc<Event>> {
        self.inbox.try_pop()
    }

    /// Events waiting in this subscriber's inbox.
    pub fn pending(&self) -> usize {
        self.inbox.len()
    }

    /// Ordinary events this subscriber lost to backpressure.
    pub fn dropped(&self) -> u64 {
        self.inbox.dropped()
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.bus.remove_subscriber(self.id, &self.topics);
    }
}
