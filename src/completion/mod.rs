//! Completed-command processor: closes the correlation loop.
//!
//! A second, independent consumer group on the event topic. It does not
//! compete with the event consumer - both groups see every event. Each
//! message is inspected for a correlation identifier; matches resolve the
//! corresponding entry in the pending-command registry, and everything
//! else (domain events, stale results, duplicates) is acknowledged and
//! ignored. Idempotence lives in the registry, so at-least-once delivery
//! of results can never double-resolve a command.

use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info};

use crate::bus::{MessageBus, PublishError, Subscription};
use crate::command::PendingCommands;
use crate::config::ConsumerSettings;
use crate::event::CommandResult;

/// Statistics from the processor loop.
#[derive(Debug, Default, Clone)]
pub struct ProcessorStats {
    /// Results that resolved a live pending command.
    pub resolved: usize,
    /// Results whose command was already resolved (or never known here).
    pub stale: usize,
    /// Messages without correlation metadata (domain events).
    pub ignored: usize,
}

/// Consumes the event topic and resolves pending commands from result
/// events.
pub struct CompletedCommandProcessor {
    bus: Arc<dyn MessageBus>,
    group: String,
    topic: String,
    pending: PendingCommands,
    settings: ConsumerSettings,
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<ProcessorStats>>,
}

impl CompletedCommandProcessor {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        group: impl Into<String>,
        topic: impl Into<String>,
        pending: PendingCommands,
    ) -> Self {
        Self {
            bus,
            group: group.into(),
            topic: topic.into(),
            pending,
            settings: ConsumerSettings::default(),
            stop: None,
            handle: None,
        }
    }

    pub fn with_settings(mut self, settings: ConsumerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Join the consumer group and start processing. Idempotent.
    pub fn start(&mut self) -> Result<(), PublishError> {
        if self.handle.is_some() {
            return Ok(());
        }

        let subscription = self.bus.subscribe(&self.group, &self.topic)?;
        let (stop_tx, stop_rx) = channel();
        let pending = self.pending.clone();
        let poll_timeout = self.settings.poll_timeout_ms;

        let handle =
            thread::spawn(move || process_loop(subscription, pending, stop_rx, poll_timeout));

        self.stop = Some(stop_tx);
        self.handle = Some(handle);
        info!(group = %self.group, topic = %self.topic, "completed-command processor started");
        Ok(())
    }

    /// Stop the processor loop and return its statistics.
    pub fn stop(&mut self) -> ProcessorStats {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or_default(),
            None => ProcessorStats::default(),
        }
    }
}

impl Drop for CompletedCommandProcessor {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

fn process_loop(
    subscription: Box<dyn Subscription>,
    pending: PendingCommands,
    stop_rx: Receiver<()>,
    poll_timeout: u64,
) -> ProcessorStats {
    let mut stats = ProcessorStats::default();

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

        if message.correlation_id().is_some() {
            match message.decode::<CommandResult>() {
                Ok(result) => {
                    if pending.resolve(&result.correlation_id, result.outcome()) {
                        stats.resolved += 1;
                        debug!(
                            correlation_id = %result.correlation_id,
                            success = result.success,
                            "pending command resolved"
                        );
                    } else {
                        // Already resolved (timeout or duplicate delivery),
                        // or a command this process never sent.
                        stats.stale += 1;
                        debug!(
                            correlation_id = %result.correlation_id,
                            "stale or unmatched result, ignoring"
                        );
                    }
                }
                Err(e) => {
                    error!(message_id = %message.id, "undecodable result message: {}", e);
                }
            }
        } else {
            stats.ignored += 1;
        }

        let _ = subscription.ack(&message.id);
    }

    stats
}
