//! Event consumer: applies domain events to registered handlers.

use std::collections::HashMap;
use std::error::Error;
use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::bus::{Message, MessageBus, PublishError, Subscription};
use crate::config::{ConsumerSettings, HandleMode};

use super::types::DomainEvent;

const CONCURRENT_POOL_SIZE: usize = 4;

/// Handler for one domain-event kind.
pub trait EventHandler: Send + Sync {
    fn apply(&self, event: &DomainEvent) -> Result<(), Box<dyn Error + Send + Sync>>;
}

/// Statistics from the event consume loop.
#[derive(Debug, Default, Clone)]
pub struct EventConsumerStats {
    /// Events applied to at least one handler.
    pub processed: usize,
    /// Stale redeliveries skipped (sequence at or below the last seen).
    pub skipped_stale: usize,
    /// Messages with no registered handler (result events included).
    pub ignored: usize,
    /// Handler invocations that returned an error.
    pub handler_errors: usize,
}

impl EventConsumerStats {
    fn merge(&mut self, other: EventConsumerStats) {
        self.processed += other.processed;
        self.skipped_stale += other.skipped_stale;
        self.ignored += other.ignored;
        self.handler_errors += other.handler_errors;
    }
}

/// Consumes the event topic and applies events to interested handlers.
///
/// In `Sequential` mode (what the event topic requires) messages are
/// processed one at a time in arrival order, and a redelivered event whose
/// sequence is at or below the last seen for its aggregate is skipped - so
/// handlers observe per-aggregate sequences in increasing order. In
/// `Concurrent` mode messages fan out to a small worker pool with no
/// ordering guarantee; only use it on topics where handlers do not depend
/// on order.
pub struct EventConsumer {
    bus: Arc<dyn MessageBus>,
    group: String,
    topic: String,
    settings: ConsumerSettings,
    handlers: HashMap<String, Vec<Arc<dyn EventHandler>>>,
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<EventConsumerStats>>,
}

impl EventConsumer {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        group: impl Into<String>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            group: group.into(),
            topic: topic.into(),
            settings: ConsumerSettings::sequential(),
            handlers: HashMap::new(),
            stop: None,
            handle: None,
        }
    }

    pub fn with_settings(mut self, settings: ConsumerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Register a handler for an event kind. Multiple handlers per kind are
    /// applied in registration order. Must be called before
    /// [`EventConsumer::start`].
    pub fn register(&mut self, kind: impl Into<String>, handler: impl EventHandler + 'static) {
        self.handlers
            .entry(kind.into())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Join the consumer group and start consuming. Idempotent.
    pub fn start(&mut self) -> Result<(), PublishError> {
        if self.handle.is_some() {
            return Ok(());
        }

        let subscription = self.bus.subscribe(&self.group, &self.topic)?;
        let (stop_tx, stop_rx) = channel();
        let handlers = self.handlers.clone();
        let poll_timeout = self.settings.poll_timeout_ms;
        let mode = self.settings.handle_mode;

        let handle = thread::spawn(move || match mode {
            HandleMode::Sequential => {
                sequential_loop(subscription, handlers, stop_rx, poll_timeout)
            }
            HandleMode::Concurrent => {
                concurrent_loop(subscription, handlers, stop_rx, poll_timeout)
            }
        });

        self.stop = Some(stop_tx);
        self.handle = Some(handle);
        info!(group = %self.group, topic = %self.topic, mode = ?mode, "event consumer started");
        Ok(())
    }

    /// Stop the consume loop and return its statistics.
    pub fn stop(&mut self) -> EventConsumerStats {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or_default(),
            None => EventConsumerStats::default(),
        }
    }
}

impl Drop for EventConsumer {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

/// Apply one event to every handler registered for its kind.
fn apply_handlers(
    handlers: &[Arc<dyn EventHandler>],
    event: &DomainEvent,
    stats: &mut EventConsumerStats,
) {
    for handler in handlers {
        if let Err(e) = handler.apply(event) {
            // One failing subscriber must not starve the others.
            stats.handler_errors += 1;
            error!(
                aggregate_id = %event.aggregate_id,
                sequence = event.sequence,
                "event handler failed: {}",
                e
            );
        }
    }
    stats.processed += 1;
}

fn sequential_loop(
    subscription: Box<dyn Subscription>,
    handlers: HashMap<String, Vec<Arc<dyn EventHandler>>>,
    stop_rx: Receiver<()>,
    poll_timeout: u64,
) -> EventConsumerStats {
    let mut stats = EventConsumerStats::default();
    let mut last_seen: HashMap<String, u64> = HashMap::new();

    loop {
        match stop_rx.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }

        let message = match subscription.poll(poll_timeout) {
            Ok(Some(message)) => message,
            Ok(None) => continue,
            Err(e) => {
                error!("poll failed: {}", e);
                thread::sleep(Duration::from_millis(100));
                continue;
            }
        };

        let Some(kind_handlers) = handlers.get(&message.kind) else {
            // Not ours: result events and kinds nobody subscribed to.
            stats.ignored += 1;
            let _ = subscription.ack(&message.id);
            continue;
        };

        let event: DomainEvent = match message.decode() {
            Ok(event) => event,
            Err(e) => {
                error!(message_id = %message.id, "undecodable event message: {}", e);
                stats.ignored += 1;
                let _ = subscription.ack(&message.id);
                continue;
            }
        };

        if let Some(&last) = last_seen.get(&event.aggregate_id) {
            if event.sequence <= last {
                warn!(
                    aggregate_id = %event.aggregate_id,
                    sequence = event.sequence,
                    last,
                    "skipping stale redelivery"
                );
                stats.skipped_stale += 1;
                let _ = subscription.ack(&message.id);
                continue;
            }
        }

        apply_handlers(kind_handlers, &event, &mut stats);
        last_seen.insert(event.aggregate_id.clone(), event.sequence);
        debug!(
            aggregate_id = %event.aggregate_id,
            sequence = event.sequence,
            kind = %event.kind,
            "event applied"
        );
        let _ = subscription.ack(&message.id);
    }

    stats
}

fn concurrent_loop(
    subscription: Box<dyn Subscription>,
    handlers: HashMap<String, Vec<Arc<dyn EventHandler>>>,
    stop_rx: Receiver<()>,
    poll_timeout: u64,
) -> EventConsumerStats {
    let (ack_tx, ack_rx) = channel::<String>();
    let mut workers = Vec::new();
    let mut feeds = Vec::new();

    for _ in 0..CONCURRENT_POOL_SIZE {
        let (feed_tx, feed_rx) = channel::<Message>();
        let handlers = handlers.clone();
        let ack_tx = ack_tx.clone();
        workers.push(thread::spawn(move || {
            worker_loop(feed_rx, handlers, ack_tx)
        }));
        feeds.push(feed_tx);
    }
    drop(ack_tx);

    let mut next = 0usize;
    loop {
        match stop_rx.try_recv() {
            Ok(()) | Err(TryRecvError::Disconnected) => break,
            Err(TryRecvError::Empty) => {}
        }

        for message_id in ack_rx.try_iter() {
            let _ = subscription.ack(&message_id);
        }

        match subscription.poll(poll_timeout) {
            Ok(Some(message)) => {
                // Round-robin across the pool; no ordering promised here.
                let _ = feeds[next % feeds.len()].send(message);
                next += 1;
            }
            Ok(None) => {}
            Err(e) => {
                error!("poll failed: {}", e);
                thread::sleep(Duration::from_millis(100));
            }
        }
    }

    drop(feeds);
    let mut stats = EventConsumerStats::default();
    for worker in workers {
        if let Ok(worker_stats) = worker.join() {
            stats.merge(worker_stats);
        }
    }
    // Acks produced while the pool drained.
    for message_id in ack_rx.iter() {
        let _ = subscription.ack(&message_id);
    }

    stats
}

fn worker_loop(
    feed: Receiver<Message>,
    handlers: HashMap<String, Vec<Arc<dyn EventHandler>>>,
    ack_tx: Sender<String>,
) -> EventConsumerStats {
    let mut stats = EventConsumerStats::default();

    for message in feed.iter() {
        match handlers.get(&message.kind) {
            Some(kind_handlers) => match message.decode::<DomainEvent>() {
                Ok(event) => apply_handlers(kind_handlers, &event, &mut stats),
                Err(e) => {
                    error!(message_id = %message.id, "undecodable event message: {}", e);
                    stats.ignored += 1;
                }
            },
            None => stats.ignored += 1,
        }
        let _ = ack_tx.send(message.id);
    }

    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use crate::event::types::RESULT_KIND;
    use std::sync::Mutex;

    struct Recording {
        seen: Arc<Mutex<Vec<(String, u64)>>>,
    }

    impl EventHandler for Recording {
        fn apply(&self, event: &DomainEvent) -> Result<(), Box<dyn Error + Send + Sync>> {
            self.seen
                .lock()
                .unwrap()
                .push((event.aggregate_id.clone(), event.sequence));
            Ok(())
        }
    }

    fn event_message(aggregate: &str, sequence: u64) -> Message {
        let event = DomainEvent::new(aggregate, sequence, "AccountCredited", Vec::new());
        Message::encode(event.message_id(), "AccountCredited", aggregate, &event).unwrap()
    }

    fn wait_until(deadline_ms: u64, mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..(deadline_ms / 10).max(1) {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        check()
    }

    #[test]
    fn sequential_preserves_per_aggregate_order() {
        let bus = InMemoryBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut consumer = EventConsumer::new(Arc::new(bus.clone()), "event-consumer", "events");
        consumer.register(
            "AccountCredited",
            Recording {
                seen: Arc::clone(&seen),
            },
        );
        consumer.start().unwrap();

        for sequence in 1..=5 {
            bus.publish("events", event_message("acct-1", sequence)).unwrap();
        }

        assert!(wait_until(2000, || seen.lock().unwrap().len() == 5));
        let observed: Vec<u64> = seen.lock().unwrap().iter().map(|(_, s)| *s).collect();
        assert_eq!(observed, vec![1, 2, 3, 4, 5]);

        consumer.stop();
    }

    #[test]
    fn sequential_skips_stale_redelivery() {
        let bus = InMemoryBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut consumer = EventConsumer::new(Arc::new(bus.clone()), "event-consumer", "events");
        consumer.register(
            "AccountCredited",
            Recording {
                seen: Arc::clone(&seen),
            },
        );
        consumer.start().unwrap();

        // A duplicate of sequence 1 arrives after sequence 2 (same key, so
        // the same queue - arrival order is deterministic).
        bus.publish("events", event_message("acct-1", 1)).unwrap();
        bus.publish("events", event_message("acct-1", 2)).unwrap();
        let mut duplicate = event_message("acct-1", 1);
        duplicate.id = "acct-1#1-redelivery".to_string();
        bus.publish("events", duplicate).unwrap();

        assert!(wait_until(2000, || seen.lock().unwrap().len() >= 2));
        // Give the loop time to reach (and skip) the duplicate.
        thread::sleep(Duration::from_millis(200));
        let stats = consumer.stop();

        let observed: Vec<u64> = seen.lock().unwrap().iter().map(|(_, s)| *s).collect();
        assert_eq!(observed, vec![1, 2]);
        assert_eq!(stats.skipped_stale, 1);
    }

    #[test]
    fn unhandled_kinds_are_acked_and_ignored() {
        let bus = InMemoryBus::new();
        let mut consumer = EventConsumer::new(Arc::new(bus.clone()), "event-consumer", "events");
        consumer.start().unwrap();

        bus.publish(
            "events",
            Message::new("result#cmd-1", RESULT_KIND, "cmd-1", Vec::new()),
        )
        .unwrap();

        thread::sleep(Duration::from_millis(300));
        let stats = consumer.stop();
        assert_eq!(stats.ignored, 1);
        assert_eq!(stats.processed, 0);
    }

    #[test]
    fn concurrent_mode_processes_all_messages() {
        let bus = InMemoryBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut consumer = EventConsumer::new(Arc::new(bus.clone()), "event-consumer", "events")
            .with_settings(ConsumerSettings::default()); // Concurrent
        consumer.register(
            "AccountCredited",
            Recording {
                seen: Arc::clone(&seen),
            },
        );
        consumer.start().unwrap();

        for i in 0..8 {
            bus.publish("events", event_message(&format!("acct-{}", i), 1))
                .unwrap();
        }

        assert!(wait_until(2000, || seen.lock().unwrap().len() == 8));
        consumer.stop();
    }
}
