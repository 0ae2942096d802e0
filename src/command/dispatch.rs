//! Command dispatch service: send, resolve, and the timeout sweep.

use std::sync::mpsc::{channel, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::bus::{Message, MessageBus};

use super::pending::{CommandHandle, PendingCommands};
use super::{Command, CommandOutcome, SendError};

/// Statistics from the timeout sweep worker.
#[derive(Debug, Default, Clone)]
pub struct SweepStats {
    pub sweeps: usize,
    pub timed_out: usize,
}

/// Sends commands and tracks them until a result event resolves them.
///
/// ## Example
///
/// ```ignore
/// let mut service = CommandService::new(bus, "commands");
/// service.start();
///
/// let handle = service.send(Command::new("cmd-1", "DepositMoney", payload))?;
/// match handle.wait_timeout(Duration::from_secs(5)) {
///     Some(outcome) => println!("resolved: {:?}", outcome),
///     None => println!("still pending"),
/// }
/// ```
///
/// The sweep worker runs for the service's lifetime and bounds memory
/// growth from commands whose result event is lost: anything past its
/// deadline is resolved with [`CommandOutcome::TimedOut`].
pub struct CommandService {
    bus: Arc<dyn MessageBus>,
    topic: String,
    command_timeout: Duration,
    sweep_interval: Duration,
    pending: PendingCommands,
    sweep_stop: Option<Sender<()>>,
    sweep_handle: Option<JoinHandle<SweepStats>>,
}

impl CommandService {
    /// Create a service publishing to the given command topic.
    ///
    /// Defaults: 30 s command timeout, 1 s sweep interval. The sweep does
    /// not run until [`CommandService::start`] is called.
    pub fn new(bus: Arc<dyn MessageBus>, topic: impl Into<String>) -> Self {
        Self {
            bus,
            topic: topic.into(),
            command_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(1),
            pending: PendingCommands::new(),
            sweep_stop: None,
            sweep_handle: None,
        }
    }

    /// Set how long a command may stay pending before it times out.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the interval between timeout sweeps.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Start the timeout sweep worker. Idempotent.
    pub fn start(&mut self) {
        if self.sweep_handle.is_some() {
            return;
        }

        let (stop_tx, stop_rx) = channel();
        let pending = self.pending.clone();
        let interval = self.sweep_interval;

        let handle = thread::spawn(move || {
            let mut stats = SweepStats::default();

            loop {
                match stop_rx.try_recv() {
                    Ok(()) | Err(TryRecvError::Disconnected) => break,
                    Err(TryRecvError::Empty) => {}
                }

                stats.sweeps += 1;
                stats.timed_out += pending.sweep(Instant::now());

                thread::sleep(interval);
            }

            stats
        });

        self.sweep_stop = Some(stop_tx);
        self.sweep_handle = Some(handle);
        info!(topic = %self.topic, "command service started");
    }

    /// Register the command as pending, publish it, and return the caller's
    /// handle.
    ///
    /// If the bus rejects the publish the pending entry is rolled back and
    /// the error surfaces; the caller decides whether to retry.
    pub fn send(&self, command: Command) -> Result<CommandHandle, SendError> {
        let handle = self.pending.register(&command.id, self.command_timeout)?;

        let message = Message::encode(
            command.id.clone(),
            command.kind.clone(),
            command.id.clone(),
            &command,
        )
        .map_err(|e| {
            self.pending.discard(&command.id);
            SendError::Encode(e.to_string())
        })?;

        if let Err(e) = self.bus.publish(&self.topic, message) {
            self.pending.discard(&command.id);
            return Err(SendError::Publish(e));
        }

        debug!(command_id = %command.id, kind = %command.kind, "command sent");
        Ok(handle)
    }

    /// Resolve a pending command. Called by the completed-command
    /// processor; stale or duplicate resolutions return `false` and are
    /// otherwise ignored.
    pub fn resolve(&self, command_id: &str, outcome: CommandOutcome) -> bool {
        self.pending.resolve(command_id, outcome)
    }

    /// A handle on the pending registry, for the completed-command
    /// processor and for introspection.
    pub fn pending(&self) -> PendingCommands {
        self.pending.clone()
    }

    /// Stop the sweep worker and return its statistics.
    pub fn stop(&mut self) -> SweepStats {
        if let Some(stop) = self.sweep_stop.take() {
            let _ = stop.send(());
        }
        match self.sweep_handle.take() {
            Some(handle) => handle.join().unwrap_or_default(),
            None => SweepStats::default(),
        }
    }
}

impl Drop for CommandService {
    fn drop(&mut self) {
        if let Some(stop) = self.sweep_stop.take() {
            let _ = stop.send(());
        }
        // Don't join on drop - let the thread finish naturally
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{InMemoryBus, PublishError, QueueAssignments, Subscription};
    use std::collections::HashSet;

    // Bus that rejects every publish, for rollback tests.
    struct RejectingBus;

    impl QueueAssignments for RejectingBus {
        fn assigned_queues(&self, _group: &str) -> HashSet<crate::bus::QueueId> {
            HashSet::new()
        }
    }

    impl MessageBus for RejectingBus {
        fn publish(&self, _topic: &str, _message: Message) -> Result<(), PublishError> {
            Err(PublishError::Rejected("broker unavailable".into()))
        }

        fn subscribe(
            &self,
            _group: &str,
            _topic: &str,
        ) -> Result<Box<dyn Subscription>, PublishError> {
            Err(PublishError::ConnectionFailed("broker unavailable".into()))
        }
    }

    #[test]
    fn send_registers_pending_and_publishes() {
        let bus = InMemoryBus::new();
        let service = CommandService::new(Arc::new(bus.clone()), "commands");

        let handle = service
            .send(Command::new("cmd-1", "DepositMoney", Vec::new()))
            .unwrap();

        assert_eq!(handle.command_id(), "cmd-1");
        assert!(service.pending().contains("cmd-1"));
        assert_eq!(bus.published_len("commands"), 1);
    }

    #[test]
    fn rejected_publish_rolls_back_pending() {
        let service = CommandService::new(Arc::new(RejectingBus), "commands");

        match service.send(Command::new("cmd-1", "DepositMoney", Vec::new())) {
            Err(SendError::Publish(_)) => {}
            other => panic!("expected publish error, got {:?}", other.err()),
        }
        assert!(service.pending().is_empty());

        // The id is free again after the rollback.
        assert!(matches!(
            service.send(Command::new("cmd-1", "DepositMoney", Vec::new())),
            Err(SendError::Publish(_))
        ));
    }

    #[test]
    fn sweep_worker_times_out_unresolved_commands() {
        let bus = InMemoryBus::new();
        let mut service = CommandService::new(Arc::new(bus), "commands")
            .with_command_timeout(Duration::from_millis(20))
            .with_sweep_interval(Duration::from_millis(10));
        service.start();

        let handle = service
            .send(Command::new("cmd-1", "DepositMoney", Vec::new()))
            .unwrap();

        assert_eq!(
            handle.wait_timeout(Duration::from_secs(2)),
            Some(CommandOutcome::TimedOut)
        );
        assert!(service.pending().is_empty());

        let stats = service.stop();
        assert_eq!(stats.timed_out, 1);
        assert!(stats.sweeps >= 1);
    }

    #[test]
    fn resolve_is_idempotent_through_the_service() {
        let bus = InMemoryBus::new();
        let service = CommandService::new(Arc::new(bus), "commands");

        let handle = service
            .send(Command::new("cmd-1", "DepositMoney", Vec::new()))
            .unwrap();

        assert!(service.resolve("cmd-1", CommandOutcome::Succeeded));
        assert!(!service.resolve("cmd-1", CommandOutcome::Succeeded));
        assert_eq!(handle.wait(), Some(CommandOutcome::Succeeded));
    }
}
