//! In-process publish/subscribe for flow events.
//!
//! Topics are `(flow, event kind)` pairs, plus wildcard topics that match one
//! kind across every flow. Each subscriber owns a bounded delivery queue;
//! publishing never waits on a subscriber and drops the event for any
//! subscriber whose queue is full. Registrations are removed when the
//! subscriber is dropped, when its cancellation token fires, or when the bus
//! shuts down.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};

use aicoder_common::{Event, Topic};
use futures::Stream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Cheap-to-clone handle to a shared event bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    registrations: Mutex<HashMap<Topic, Vec<Registration>>>,
    next_id: AtomicU64,
    buffer: usize,
    closed: CancellationToken,
}

struct Registration {
    id: u64,
    tx: mpsc::Sender<Event>,
}

impl BusInner {
    fn registry(&self) -> MutexGuard<'_, HashMap<Topic, Vec<Registration>>> {
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn unregister(&self, topic: Topic, id: u64) {
        let mut registry = self.registry();
        if let Some(list) = registry.get_mut(&topic) {
            list.retain(|r| r.id != id);
            if list.is_empty() {
                registry.remove(&topic);
            }
        }
    }
}

impl EventBus {
    /// Create a bus whose subscribers each buffer up to `buffer` events.
    pub fn new(buffer: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                registrations: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                buffer: buffer.max(1),
                closed: CancellationToken::new(),
            }),
        }
    }

    /// Register a consumer for `topic`.
    ///
    /// The returned subscription yields events until `ctx` is cancelled, the
    /// subscription is dropped, or the bus shuts down. Must be called from
    /// within a tokio runtime.
    pub fn subscribe(&self, topic: Topic, ctx: &CancellationToken) -> Subscription {
        let (tx, rx) = mpsc::channel(self.inner.buffer);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let subscription = Subscription {
            id,
            topic,
            rx,
            bus: Arc::downgrade(&self.inner),
        };

        if self.inner.closed.is_cancelled() || ctx.is_cancelled() {
            // Sender dropped here, so the stream ends immediately.
            return subscription;
        }

        self.inner.registry().entry(topic).or_default().push(Registration {
            id,
            tx: tx.clone(),
        });
        debug!(?topic, subscriber = id, "Subscriber registered");

        let bus = Arc::downgrade(&self.inner);
        let ctx = ctx.clone();
        let closed = self.inner.closed.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = ctx.cancelled() => {}
                _ = closed.cancelled() => {}
                _ = tx.closed() => {}
            }
            if let Some(inner) = bus.upgrade() {
                inner.unregister(topic, id);
                debug!(?topic, subscriber = id, "Subscriber released");
            }
        });

        subscription
    }

    /// Deliver `event` to every consumer of its topic and of the matching
    /// wildcard topic. Returns how many consumers accepted it.
    pub fn publish(&self, event: Event) -> usize {
        let exact = Topic::of(&event);
        let wildcard = Topic::any_flow(event.kind());

        let targets: Vec<(Topic, u64, mpsc::Sender<Event>)> = {
            let registry = self.inner.registry();
            [exact, wildcard]
                .iter()
                .filter_map(|topic| registry.get(topic).map(|list| (*topic, list)))
                .flat_map(|(topic, list)| list.iter().map(move |r| (topic, r.id, r.tx.clone())))
                .collect()
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (topic, id, tx) in targets {
            match tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    debug!(?topic, subscriber = id, "Subscriber queue full, event dropped");
                }
                Err(TrySendError::Closed(_)) => dead.push((topic, id)),
            }
        }

        for (topic, id) in dead {
            self.inner.unregister(topic, id);
        }

        delivered
    }

    /// Number of live registrations on exactly `topic`.
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.inner.registry().get(topic).map_or(0, Vec::len)
    }

    /// Release every registration; all subscriptions end once drained.
    pub fn shutdown(&self) {
        self.inner.closed.cancel();
        self.inner.registry().clear();
    }
}

/// Receive side of a registration. Implements [`Stream`].
pub struct Subscription {
    id: u64,
    topic: Topic,
    rx: mpsc::Receiver<Event>,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Wait for the next event; `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Take an already-delivered event without waiting.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = Event;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            inner.unregister(self.topic, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aicoder_common::{Browser, EventKind};
    use futures::StreamExt;
    use std::time::Duration;

    fn browser_event(flow_id: i64, url: &str) -> Event {
        Event::BrowserUpdated {
            flow_id,
            browser: Browser {
                url: url.to_string(),
                screenshot_url: String::new(),
            },
        }
    }

    fn url_of(event: &Event) -> &str {
        match event {
            Event::BrowserUpdated { browser, .. } => &browser.url,
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_subscriber_receives_event_exactly_once() {
        let bus = EventBus::new(8);
        let ctx = CancellationToken::new();
        let mut sub = bus.subscribe(Topic::flow(1, EventKind::BrowserUpdated), &ctx);

        assert_eq!(bus.publish(browser_event(1, "a")), 1);

        let event = sub.recv().await.unwrap();
        assert_eq!(url_of(&event), "a");
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_no_replay() {
        let bus = EventBus::new(8);
        let ctx = CancellationToken::new();
        assert_eq!(bus.publish(browser_event(1, "early")), 0);

        let mut sub = bus.subscribe(Topic::flow(1, EventKind::BrowserUpdated), &ctx);
        assert!(sub.try_recv().is_none());

        bus.publish(browser_event(1, "late"));
        assert_eq!(url_of(&sub.recv().await.unwrap()), "late");
    }

    #[tokio::test]
    async fn test_topics_are_isolated_by_flow_and_kind() {
        let bus = EventBus::new(8);
        let ctx = CancellationToken::new();
        let mut flow_one = bus.subscribe(Topic::flow(1, EventKind::BrowserUpdated), &ctx);
        let mut other_kind = bus.subscribe(Topic::flow(2, EventKind::TaskAdded), &ctx);

        assert_eq!(bus.publish(browser_event(2, "x")), 0);
        assert!(flow_one.try_recv().is_none());
        assert!(other_kind.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_wildcard_subscriber_sees_every_flow() {
        let bus = EventBus::new(8);
        let ctx = CancellationToken::new();
        let mut all = bus.subscribe(Topic::any_flow(EventKind::BrowserUpdated), &ctx);

        bus.publish(browser_event(1, "one"));
        bus.publish(browser_event(2, "two"));

        assert_eq!(url_of(&all.recv().await.unwrap()), "one");
        assert_eq!(url_of(&all.recv().await.unwrap()), "two");
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_block_others() {
        let bus = EventBus::new(2);
        let ctx = CancellationToken::new();
        let topic = Topic::flow(1, EventKind::BrowserUpdated);
        let mut slow = bus.subscribe(topic, &ctx);
        let mut fast = bus.subscribe(topic, &ctx);

        for i in 0..5 {
            bus.publish(browser_event(1, &i.to_string()));
            // fast drains as it goes
            assert_eq!(url_of(&fast.recv().await.unwrap()), i.to_string());
        }

        // slow kept only the first two; the rest were dropped
        assert_eq!(url_of(&slow.recv().await.unwrap()), "0");
        assert_eq!(url_of(&slow.recv().await.unwrap()), "1");
        assert!(slow.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_cancelled_context_ends_stream_and_releases_registration() {
        let bus = EventBus::new(8);
        let ctx = CancellationToken::new();
        let topic = Topic::flow(3, EventKind::BrowserUpdated);
        let mut sub = bus.subscribe(topic, &ctx);
        assert_eq!(bus.subscriber_count(&topic), 1);

        ctx.cancel();
        let next = tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .expect("stream should end after cancellation");
        assert!(next.is_none());
        assert_eq!(bus.subscriber_count(&topic), 0);
        assert_eq!(bus.publish(browser_event(3, "after")), 0);
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_unregistered() {
        let bus = EventBus::new(8);
        let ctx = CancellationToken::new();
        let topic = Topic::flow(4, EventKind::BrowserUpdated);
        let sub = bus.subscribe(topic, &ctx);
        assert_eq!(bus.subscriber_count(&topic), 1);

        drop(sub);
        assert_eq!(bus.subscriber_count(&topic), 0);
        assert_eq!(bus.publish(browser_event(4, "gone")), 0);
    }

    #[tokio::test]
    async fn test_shutdown_ends_all_subscriptions() {
        let bus = EventBus::new(8);
        let ctx = CancellationToken::new();
        let mut a = bus.subscribe(Topic::flow(1, EventKind::BrowserUpdated), &ctx);
        let mut b = bus.subscribe(Topic::any_flow(EventKind::FlowUpdated), &ctx);

        bus.shutdown();

        let a_end = tokio::time::timeout(Duration::from_secs(1), a.recv()).await.unwrap();
        let b_end = tokio::time::timeout(Duration::from_secs(1), b.recv()).await.unwrap();
        assert!(a_end.is_none());
        assert!(b_end.is_none());

        // Subscribing after shutdown yields an already-ended stream.
        let mut late = bus.subscribe(Topic::flow(1, EventKind::BrowserUpdated), &ctx);
        assert!(late.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_publishers() {
        let bus = EventBus::new(256);
        let ctx = CancellationToken::new();
        let mut sub = bus.subscribe(Topic::any_flow(EventKind::BrowserUpdated), &ctx);

        let mut handles = Vec::new();
        for flow_id in 0..8 {
            let bus = bus.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..10 {
                    bus.publish(browser_event(flow_id, &i.to_string()));
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut received = 0;
        while sub.try_recv().is_some() {
            received += 1;
        }
        assert_eq!(received, 80);
    }
}
