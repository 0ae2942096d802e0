//! Configuration for consumers and the service context.
//!
//! Plain structs with `Default` impls; no config framework. The defaults
//! mirror the deployment the design was lifted from: four queues per topic
//! and one-second intervals for every periodic concern.

use std::time::Duration;

/// How a consumer hands messages to its handlers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleMode {
    /// Fan out to a small worker pool; no ordering across messages.
    Concurrent,
    /// One message at a time, in arrival order. Required on the event
    /// topic, where per-aggregate ordering must hold.
    Sequential,
}

/// Tuning knobs for one consumer-group member.
#[derive(Clone, Debug)]
pub struct ConsumerSettings {
    /// Broker heartbeat interval.
    pub heartbeat_interval: Duration,
    /// Topic metadata (queue count) refresh interval.
    pub metadata_refresh_interval: Duration,
    /// Interval between consumer-group rebalance checks.
    pub rebalance_check_interval: Duration,
    /// How messages are dispatched to handlers.
    pub handle_mode: HandleMode,
    /// Poll timeout used by the consume loop.
    pub poll_timeout_ms: u64,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(1000),
            metadata_refresh_interval: Duration::from_millis(1000),
            rebalance_check_interval: Duration::from_millis(1000),
            handle_mode: HandleMode::Concurrent,
            poll_timeout_ms: 100,
        }
    }
}

impl ConsumerSettings {
    /// Default settings with sequential handling (event-topic consumers).
    pub fn sequential() -> Self {
        Self {
            handle_mode: HandleMode::Sequential,
            ..Self::default()
        }
    }
}

/// Configuration for a [`ServiceContext`](crate::ServiceContext).
#[derive(Clone, Debug)]
pub struct ContextConfig {
    /// Topic commands are sent to.
    pub command_topic: String,
    /// Topic domain events and command results are published to.
    pub event_topic: String,
    /// Expected queue count per topic; the rebalance barrier gates on it.
    pub partition_count: u32,
    /// How long a sent command may stay pending before the sweep expires it.
    pub command_timeout: Duration,
    /// Interval between timeout sweeps.
    pub sweep_interval: Duration,
    /// Interval between rebalance barrier polls.
    pub barrier_poll_interval: Duration,
    /// Upper bound on the startup rebalance wait. `None` blocks until
    /// convergence, however long that takes.
    pub barrier_max_wait: Option<Duration>,
    /// Consumer group names for the three loops.
    pub command_group: String,
    pub event_group: String,
    pub processor_group: String,
    /// Settings for the command consumer.
    pub command_consumer: ConsumerSettings,
    /// Settings for the event consumer; sequential by default.
    pub event_consumer: ConsumerSettings,
    /// Settings for the completed-command processor.
    pub processor: ConsumerSettings,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            command_topic: "commands".to_string(),
            event_topic: "events".to_string(),
            partition_count: 4,
            command_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(1),
            barrier_poll_interval: Duration::from_secs(1),
            barrier_max_wait: Some(Duration::from_secs(30)),
            command_group: "command-consumer".to_string(),
            event_group: "event-consumer".to_string(),
            processor_group: "completed-command-processor".to_string(),
            command_consumer: ConsumerSettings::default(),
            event_consumer: ConsumerSettings::sequential(),
            processor: ConsumerSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_observed_deployment() {
        let config = ContextConfig::default();
        assert_eq!(config.partition_count, 4);
        assert_eq!(config.sweep_interval, Duration::from_secs(1));
        assert_eq!(config.barrier_poll_interval, Duration::from_secs(1));
        assert_eq!(config.event_consumer.handle_mode, HandleMode::Sequential);
        assert_eq!(config.command_consumer.handle_mode, HandleMode::Concurrent);

        let settings = ConsumerSettings::default();
        assert_eq!(settings.heartbeat_interval, Duration::from_millis(1000));
        assert_eq!(settings.metadata_refresh_interval, Duration::from_millis(1000));
        assert_eq!(settings.rebalance_check_interval, Duration::from_millis(1000));
    }
}
