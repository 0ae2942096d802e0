//! Command consumer: pulls commands, runs handlers, publishes results.

use std::collections::HashMap;
use std::error::Error;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{channel, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::bus::{MessageBus, PublishError, Subscription};
use crate::config::ConsumerSettings;
use crate::event::{CommandResult, EventPublisher};

use super::Command;

/// Handler for one command kind.
///
/// Delivery is at-least-once - a crash between handling and acknowledgment
/// causes redelivery - so handlers must be idempotent or tolerate
/// re-execution.
pub trait CommandHandler: Send + Sync {
    fn handle(&self, command: &Command) -> Result<(), Box<dyn Error + Send + Sync>>;
}

/// Statistics from the consume loop.
#[derive(Debug, Default, Clone)]
pub struct CommandConsumerStats {
    /// Commands handled successfully.
    pub handled: usize,
    /// Commands whose handler failed (failure result published).
    pub failed: usize,
    /// Messages that could not be decoded (acked and skipped).
    pub poison: usize,
}

/// Pulls commands from the command topic and executes registered handlers.
///
/// For every command a [`CommandResult`] is published to the event topic,
/// carrying the command's id as correlation identifier. The incoming
/// message is acknowledged only after the result publish succeeded, so a
/// crash in between causes redelivery rather than a lost result.
pub struct CommandConsumer {
    bus: Arc<dyn MessageBus>,
    group: String,
    topic: String,
    publisher: EventPublisher,
    settings: ConsumerSettings,
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<CommandConsumerStats>>,
}

impl CommandConsumer {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        group: impl Into<String>,
        topic: impl Into<String>,
        publisher: EventPublisher,
    ) -> Self {
        Self {
            bus,
            group: group.into(),
            topic: topic.into(),
            publisher,
            settings: ConsumerSettings::default(),
            handlers: HashMap::new(),
            stop: None,
            handle: None,
        }
    }

    pub fn with_settings(mut self, settings: ConsumerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Register a handler for a command kind. Must be called before
    /// [`CommandConsumer::start`]; a later registration for the same kind
    /// replaces the earlier one.
    pub fn register(&mut self, kind: impl Into<String>, handler: impl CommandHandler + 'static) {
        self.handlers.insert(kind.into(), Arc::new(handler));
    }

    /// Join the consumer group and start the consume loop. Idempotent.
    pub fn start(&mut self) -> Result<(), PublishError> {
        if self.handle.is_some() {
            return Ok(());
        }

        let subscription = self.bus.subscribe(&self.group, &self.topic)?;
        let (stop_tx, stop_rx) = channel();
        let handlers = self.handlers.clone();
        let publisher = self.publisher.clone();
        let poll_timeout = self.settings.poll_timeout_ms;

        let handle = thread::spawn(move || {
            consume_loop(subscription, handlers, publisher, stop_rx, poll_timeout)
        });

        self.stop = Some(stop_tx);
        self.handle = Some(handle);
        info!(group = %self.group, topic = %self.topic, "command consumer started");
        Ok(())
    }

    /// Stop the consume loop and return its statistics.
    pub fn stop(&mut self) -> CommandConsumerStats {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or_default(),
            None => CommandConsumerStats::default(),
        }
    }
}

impl Drop for CommandConsumer {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

fn consume_loop(
    subscription: Box<dyn Subscription>,
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
    publisher: EventPublisher,
    stop_rx: std::sync::mpsc::Receiver<()>,
    poll_timeout: u64,
) -> CommandConsumerStats {
    let mut stats = CommandConsumerStats::default();

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

        let command: Command = match message.decode() {
            Ok(command) => command,
            Err(e) => {
                // Poison message: acking it is the only way to unblock the
                // queue, since redelivery would fail the same way.
                error!(message_id = %message.id, "undecodable command message: {}", e);
                let _ = subscription.ack(&message.id);
                stats.poison += 1;
                continue;
            }
        };

        let result = match handlers.get(&command.kind) {
            Some(handler) => {
                // A panicking handler must not take down the consume loop.
                let outcome = catch_unwind(AssertUnwindSafe(|| handler.handle(&command)));
                match outcome {
                    Ok(Ok(())) => {
                        stats.handled += 1;
                        debug!(command_id = %command.id, kind = %command.kind, "command handled");
                        CommandResult::success(&command.id)
                    }
                    Ok(Err(e)) => {
                        stats.failed += 1;
                        warn!(command_id = %command.id, "handler failed: {}", e);
                        CommandResult::failure(&command.id, e.to_string())
                    }
                    Err(_) => {
                        stats.failed += 1;
                        error!(command_id = %command.id, "handler panicked");
                        CommandResult::failure(&command.id, "handler panicked")
                    }
                }
            }
            None => {
                stats.failed += 1;
                warn!(command_id = %command.id, kind = %command.kind, "no handler registered");
                CommandResult::failure(
                    &command.id,
                    format!("no handler registered for command kind {}", command.kind),
                )
            }
        };

        // Ack only after the result is on the bus; failing here leaves the
        // command unacked so it will be redelivered and re-handled.
        match publisher.publish_result(&result) {
            Ok(()) => {
                let _ = subscription.ack(&message.id);
            }
            Err(e) => {
                warn!(command_id = %command.id, "result publish failed, leaving unacked: {}", e);
            }
        }
    }

    stats
}
