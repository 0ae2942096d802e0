//! In-memory message bus for testing and single-process scenarios.
//!
//! Topics are partitioned logs; messages route to a partition by hashing
//! their key, so every message for one aggregate lands on the same queue.
//! Consumer groups divide a topic's queues among their members (round-robin,
//! recomputed whenever a member joins), and independent groups each see the
//! full stream.
//!
//! Delivery is at-least-once: each queue hands out one message at a time and
//! redelivers it if no acknowledgment arrives within the redelivery window.
//! A configurable `settle_delay` makes reported queue assignments converge
//! gradually after a rebalance, which is what lets the rebalance barrier be
//! exercised without a real broker.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::bus::{MessageBus, QueueAssignments, QueueId, Subscription};
use super::error::PublishError;
use super::message::Message;

const DEFAULT_PARTITIONS: u32 = 4;
const DEFAULT_REDELIVER_AFTER: Duration = Duration::from_secs(5);

/// Read cursor for one queue within one consumer group.
#[derive(Default)]
struct Cursor {
    /// Index of the next undelivered message.
    next: usize,
    /// Message handed out but not yet acknowledged: (message id, delivered at).
    inflight: Option<(String, Instant)>,
}

struct Group {
    topic: String,
    members: Vec<usize>,
    /// member id -> queues it owns
    assignments: HashMap<usize, Vec<QueueId>>,
    /// queue id -> group-level read cursor (survives rebalances)
    cursors: HashMap<QueueId, Cursor>,
    rebalanced_at: Instant,
}

struct BusInner {
    /// topic -> one log per partition
    topics: HashMap<String, Vec<Vec<Message>>>,
    groups: HashMap<String, Group>,
    next_member: usize,
    default_partitions: u32,
    settle_delay: Duration,
    redeliver_after: Duration,
}

impl BusInner {
    fn ensure_topic(&mut self, topic: &str) {
        let partitions = self.default_partitions as usize;
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions]);
    }

    fn partition_for(&self, topic: &str, key: &str) -> usize {
        let count = self.topics[topic].len();
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % count as u64) as usize
    }

    fn rebalance(&mut self, group_name: &str) {
        let BusInner { topics, groups, .. } = self;
        let group = groups.get_mut(group_name).unwrap();
        let partitions = topics[&group.topic].len();

        group.assignments.clear();
        for member in &group.members {
            group.assignments.insert(*member, Vec::new());
        }
        for queue in 0..partitions {
            let owner = group.members[queue % group.members.len()];
            group
                .assignments
                .get_mut(&owner)
                .unwrap()
                .push(queue as QueueId);
        }
        group.rebalanced_at = Instant::now();

        debug!(
            group = group_name,
            members = group.members.len(),
            partitions,
            "rebalanced consumer group"
        );
    }

    /// Next deliverable message for a member, rotating across its queues.
    fn next_for(&mut self, group_name: &str, member: usize, start: usize) -> Option<Message> {
        let redeliver_after = self.redeliver_after;
        let BusInner { topics, groups, .. } = self;
        let group = groups.get_mut(group_name)?;
        let queues = group.assignments.get(&member)?.clone();
        if queues.is_empty() {
            return None;
        }
        let log_by_queue = topics.get(&group.topic)?;

        for i in 0..queues.len() {
            let queue = queues[(start + i) % queues.len()];
            let log = &log_by_queue[queue as usize];
            let cursor = group.cursors.entry(queue).or_default();

            match &cursor.inflight {
                Some((id, delivered_at)) => {
                    if delivered_at.elapsed() >= redeliver_after {
                        warn!(queue, message_id = %id, "redelivering unacknowledged message");
                        let message = log[cursor.next].clone();
                        cursor.inflight = Some((id.clone(), Instant::now()));
                        return Some(message);
                    }
                    // Queue blocked until the in-flight message is acked.
                }
                None => {
                    if cursor.next < log.len() {
                        let message = log[cursor.next].clone();
                        cursor.inflight = Some((message.id.clone(), Instant::now()));
                        return Some(message);
                    }
                }
            }
        }
        None
    }

    fn ack(&mut self, group_name: &str, message_id: &str) {
        if let Some(group) = self.groups.get_mut(group_name) {
            for cursor in group.cursors.values_mut() {
                if matches!(&cursor.inflight, Some((id, _)) if id == message_id) {
                    cursor.next += 1;
                    cursor.inflight = None;
                    return;
                }
            }
        }
        // Unknown or already-acked id: no-op.
    }
}

/// In-memory partitioned message bus.
///
/// Thread-safe and cheap to clone (handles share the same state).
///
/// ## Example
///
/// ```
/// use dispatched::bus::{InMemoryBus, Message, MessageBus, QueueAssignments};
///
/// let bus = InMemoryBus::new();
/// let sub = bus.subscribe("billing", "events").unwrap();
///
/// bus.publish("events", Message::new("evt-1", "AccountCredited", "acct-1", Vec::new()))
///     .unwrap();
///
/// let msg = sub.poll(100).unwrap().unwrap();
/// assert_eq!(msg.kind, "AccountCredited");
/// sub.ack(&msg.id).unwrap();
///
/// assert_eq!(bus.assigned_queues("billing").len(), 4);
/// ```
#[derive(Clone)]
pub struct InMemoryBus {
    inner: Arc<Mutex<BusInner>>,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBus {
    /// Create a bus whose topics have the default partition count (4).
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                topics: HashMap::new(),
                groups: HashMap::new(),
                next_member: 0,
                default_partitions: DEFAULT_PARTITIONS,
                settle_delay: Duration::ZERO,
                redeliver_after: DEFAULT_REDELIVER_AFTER,
            })),
        }
    }

    /// Set the partition count used for topics created after this call.
    pub fn with_partitions(self, partitions: u32) -> Self {
        assert!(partitions > 0, "topics need at least one partition");
        self.inner.lock().unwrap().default_partitions = partitions;
        self
    }

    /// Make reported queue assignments converge gradually over `delay`
    /// after each rebalance, instead of appearing complete immediately.
    pub fn with_settle_delay(self, delay: Duration) -> Self {
        self.inner.lock().unwrap().settle_delay = delay;
        self
    }

    /// Set how long a polled-but-unacknowledged message waits before
    /// being redelivered.
    pub fn with_redelivery_after(self, after: Duration) -> Self {
        self.inner.lock().unwrap().redeliver_after = after;
        self
    }

    /// All messages published to a topic, partition-major (test helper).
    pub fn published(&self, topic: &str) -> Vec<Message> {
        let inner = self.inner.lock().unwrap();
        inner
            .topics
            .get(topic)
            .map(|partitions| partitions.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Total number of messages published to a topic (test helper).
    pub fn published_len(&self, topic: &str) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .topics
            .get(topic)
            .map(|partitions| partitions.iter().map(Vec::len).sum())
            .unwrap_or(0)
    }
}

impl QueueAssignments for InMemoryBus {
    fn assigned_queues(&self, group: &str) -> HashSet<QueueId> {
        let inner = self.inner.lock().unwrap();
        let Some(group) = inner.groups.get(group) else {
            return HashSet::new();
        };
        if group.members.is_empty() {
            return HashSet::new();
        }
        let total = inner.topics[&group.topic].len();

        // Simulated rebalance latency: assignments are revealed in
        // proportion to the time elapsed since the last rebalance.
        let revealed = if inner.settle_delay.is_zero() {
            total
        } else {
            let fraction =
                group.rebalanced_at.elapsed().as_secs_f64() / inner.settle_delay.as_secs_f64();
            ((fraction * total as f64) as usize).min(total)
        };
        (0..revealed as QueueId).collect()
    }
}

impl MessageBus for InMemoryBus {
    fn publish(&self, topic: &str, message: Message) -> Result<(), PublishError> {
        let mut inner = self.inner.lock().unwrap();
        inner.ensure_topic(topic);
        let partition = inner.partition_for(topic, &message.key);
        inner.topics.get_mut(topic).unwrap()[partition].push(message);
        Ok(())
    }

    fn subscribe(&self, group: &str, topic: &str) -> Result<Box<dyn Subscription>, PublishError> {
        let mut inner = self.inner.lock().unwrap();
        inner.ensure_topic(topic);

        if let Some(existing) = inner.groups.get(group) {
            if existing.topic != topic {
                return Err(PublishError::Rejected(format!(
                    "group {} is already subscribed to topic {}",
                    group, existing.topic
                )));
            }
        }

        let member = inner.next_member;
        inner.next_member += 1;

        let entry = inner.groups.entry(group.to_string()).or_insert(Group {
            topic: topic.to_string(),
            members: Vec::new(),
            assignments: HashMap::new(),
            cursors: HashMap::new(),
            rebalanced_at: Instant::now(),
        });
        entry.members.push(member);
        inner.rebalance(group);

        Ok(Box::new(InMemorySubscription {
            inner: Arc::clone(&self.inner),
            group: group.to_string(),
            member,
            rotate: AtomicUsize::new(0),
        }))
    }
}

/// One group member's subscription handle.
struct InMemorySubscription {
    inner: Arc<Mutex<BusInner>>,
    group: String,
    member: usize,
    /// Rotates the starting queue so one busy queue cannot starve the rest.
    rotate: AtomicUsize,
}

impl Subscription for InMemorySubscription {
    fn poll(&self, timeout_ms: u64) -> Result<Option<Message>, PublishError> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);

        loop {
            {
                let start = self.rotate.fetch_add(1, Ordering::Relaxed);
                let mut inner = self.inner.lock().unwrap();
                if let Some(message) = inner.next_for(&self.group, self.member, start) {
                    return Ok(Some(message));
                }
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }

            // Small sleep to avoid busy-waiting
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn ack(&self, message_id: &str) -> Result<(), PublishError> {
        self.inner.lock().unwrap().ack(&self.group, message_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: &str, key: &str) -> Message {
        Message::new(id, "TestMessage", key, Vec::new())
    }

    #[test]
    fn same_key_preserves_order() {
        let bus = InMemoryBus::new();
        let sub = bus.subscribe("group-a", "events").unwrap();

        for i in 1..=3 {
            bus.publish("events", msg(&format!("evt-{}", i), "acct-1"))
                .unwrap();
        }

        for i in 1..=3 {
            let m = sub.poll(100).unwrap().unwrap();
            assert_eq!(m.id, format!("evt-{}", i));
            sub.ack(&m.id).unwrap();
        }
    }

    #[test]
    fn independent_groups_both_receive() {
        let bus = InMemoryBus::new();
        let sub_a = bus.subscribe("group-a", "events").unwrap();
        let sub_b = bus.subscribe("group-b", "events").unwrap();

        bus.publish("events", msg("evt-1", "acct-1")).unwrap();

        assert_eq!(sub_a.poll(100).unwrap().unwrap().id, "evt-1");
        assert_eq!(sub_b.poll(100).unwrap().unwrap().id, "evt-1");
    }

    #[test]
    fn members_split_queues() {
        let bus = InMemoryBus::new();
        let _first = bus.subscribe("group-a", "events").unwrap();
        let _second = bus.subscribe("group-a", "events").unwrap();

        // Two members share the four queues; the group as a whole owns all.
        assert_eq!(bus.assigned_queues("group-a").len(), 4);
    }

    #[test]
    fn group_cannot_span_topics() {
        let bus = InMemoryBus::new();
        let _sub = bus.subscribe("group-a", "events").unwrap();
        assert!(bus.subscribe("group-a", "commands").is_err());
    }

    #[test]
    fn unacked_message_is_redelivered() {
        let bus = InMemoryBus::new().with_redelivery_after(Duration::from_millis(10));
        let sub = bus.subscribe("group-a", "events").unwrap();

        bus.publish("events", msg("evt-1", "acct-1")).unwrap();

        let first = sub.poll(100).unwrap().unwrap();
        assert_eq!(first.id, "evt-1");

        std::thread::sleep(Duration::from_millis(20));
        let second = sub.poll(100).unwrap().unwrap();
        assert_eq!(second.id, "evt-1");

        sub.ack("evt-1").unwrap();
        assert!(sub.poll(10).unwrap().is_none());
    }

    #[test]
    fn ack_of_unknown_id_is_noop() {
        let bus = InMemoryBus::new();
        let sub = bus.subscribe("group-a", "events").unwrap();
        assert!(sub.ack("never-delivered").is_ok());
    }

    #[test]
    fn assignments_settle_gradually() {
        let bus = InMemoryBus::new().with_settle_delay(Duration::from_millis(80));
        let _sub = bus.subscribe("group-a", "events").unwrap();

        assert!(bus.assigned_queues("group-a").len() < 4);

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(bus.assigned_queues("group-a").len(), 4);
    }

    #[test]
    fn unknown_group_has_no_queues() {
        let bus = InMemoryBus::new();
        assert!(bus.assigned_queues("nobody").is_empty());
    }
}
