//! Service context: explicit wiring of every component.
//!
//! One object, constructed once, owning the dispatch service, both
//! consumers, the completed-command processor, and the rebalance barrier -
//! instead of process-wide singletons. `start()` encodes the startup
//! ordering contract: the bus must already be running, consumers join
//! their groups before any traffic, and the barrier gates readiness until
//! rebalancing has converged.

use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::barrier::{BarrierError, RebalanceBarrier};
use crate::bus::{MessageBus, PublishError, QueueAssignments};
use crate::command::{
    Command, CommandConsumer, CommandHandle, CommandHandler, CommandService, SendError,
};
use crate::completion::CompletedCommandProcessor;
use crate::config::ContextConfig;
use crate::event::{EventConsumer, EventHandler, EventPublisher};

/// Error from [`ServiceContext::start`].
#[derive(Debug)]
pub enum StartError {
    /// A consumer could not join its group.
    Subscribe(PublishError),
    /// Rebalancing did not converge within the configured wait.
    Barrier(BarrierError),
}

impl fmt::Display for StartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartError::Subscribe(e) => write!(f, "subscribe failed: {}", e),
            StartError::Barrier(e) => write!(f, "rebalance barrier: {}", e),
        }
    }
}

impl Error for StartError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StartError::Subscribe(e) => Some(e),
            StartError::Barrier(e) => Some(e),
        }
    }
}

impl From<BarrierError> for StartError {
    fn from(e: BarrierError) -> Self {
        StartError::Barrier(e)
    }
}

impl From<PublishError> for StartError {
    fn from(e: PublishError) -> Self {
        StartError::Subscribe(e)
    }
}

/// Owns and wires the whole pipeline over one bus.
///
/// ## Example
///
/// ```ignore
/// let bus = InMemoryBus::new();
/// let mut context = ServiceContext::new(ContextConfig::default(), bus);
/// context.register_command_handler("DepositMoney", DepositHandler);
/// context.start()?;
///
/// let handle = context.send(Command::new("cmd-1", "DepositMoney", payload))?;
/// let outcome = handle.wait_timeout(Duration::from_secs(5));
/// ```
pub struct ServiceContext {
    command_service: CommandService,
    command_consumer: CommandConsumer,
    event_consumer: EventConsumer,
    processor: CompletedCommandProcessor,
    event_publisher: EventPublisher,
    barrier: RebalanceBarrier,
    barrier_max_wait: Option<Duration>,
    started: bool,
}

impl ServiceContext {
    /// Build the context over a running bus. Nothing subscribes or spawns
    /// until [`ServiceContext::start`].
    pub fn new(config: ContextConfig, bus: impl MessageBus + Clone + 'static) -> Self {
        let bus_handle: Arc<dyn MessageBus> = Arc::new(bus.clone());
        let assignments: Arc<dyn QueueAssignments> = Arc::new(bus);

        let event_publisher = EventPublisher::new(Arc::clone(&bus_handle), &config.event_topic);

        let command_service = CommandService::new(Arc::clone(&bus_handle), &config.command_topic)
            .with_command_timeout(config.command_timeout)
            .with_sweep_interval(config.sweep_interval);

        let command_consumer = CommandConsumer::new(
            Arc::clone(&bus_handle),
            &config.command_group,
            &config.command_topic,
            event_publisher.clone(),
        )
        .with_settings(config.command_consumer.clone());

        let event_consumer = EventConsumer::new(
            Arc::clone(&bus_handle),
            &config.event_group,
            &config.event_topic,
        )
        .with_settings(config.event_consumer.clone());

        let processor = CompletedCommandProcessor::new(
            Arc::clone(&bus_handle),
            &config.processor_group,
            &config.event_topic,
            command_service.pending(),
        )
        .with_settings(config.processor.clone());

        let expected = config.partition_count as usize;
        let barrier = RebalanceBarrier::new(assignments, config.barrier_poll_interval)
            .track(&config.command_group, expected)
            .track(&config.event_group, expected)
            .track(&config.processor_group, expected);

        Self {
            command_service,
            command_consumer,
            event_consumer,
            processor,
            event_publisher,
            barrier,
            barrier_max_wait: config.barrier_max_wait,
            started: false,
        }
    }

    /// Register a command handler. Must happen before [`ServiceContext::start`].
    pub fn register_command_handler(
        &mut self,
        kind: impl Into<String>,
        handler: impl CommandHandler + 'static,
    ) {
        self.command_consumer.register(kind, handler);
    }

    /// Register an event handler. Must happen before [`ServiceContext::start`].
    pub fn register_event_handler(
        &mut self,
        kind: impl Into<String>,
        handler: impl EventHandler + 'static,
    ) {
        self.event_consumer.register(kind, handler);
    }

    /// Start everything and block until rebalancing converges.
    ///
    /// Consumers join their groups first, so that nothing is sent into a
    /// topic whose queues are still unowned; the barrier then gates until
    /// every group holds its full queue set.
    pub fn start(&mut self) -> Result<(), StartError> {
        if self.started {
            return Ok(());
        }

        self.event_consumer.start()?;
        self.command_consumer.start()?;
        self.processor.start()?;
        self.command_service.start();

        self.barrier.start();
        match self.barrier_max_wait {
            Some(max_wait) => self.barrier.wait_timeout(max_wait)?,
            None => self.barrier.wait(),
        }

        self.started = true;
        info!("service context ready");
        Ok(())
    }

    /// Whether [`ServiceContext::start`] has completed.
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Send a command through the dispatch service.
    pub fn send(&self, command: Command) -> Result<CommandHandle, SendError> {
        self.command_service.send(command)
    }

    /// The dispatch service, for callers that hold onto it.
    pub fn command_service(&self) -> &CommandService {
        &self.command_service
    }

    /// A publisher handle for the event topic (command handlers use this
    /// to emit domain events).
    pub fn event_publisher(&self) -> EventPublisher {
        self.event_publisher.clone()
    }

    /// Stop every worker. The context can not be restarted.
    pub fn shutdown(&mut self) {
        self.command_consumer.stop();
        self.event_consumer.stop();
        self.processor.stop();
        self.command_service.stop();
        self.barrier.stop();
        self.started = false;
        info!("service context stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use crate::command::CommandOutcome;

    struct NoopHandler;

    impl CommandHandler for NoopHandler {
        fn handle(&self, _command: &Command) -> Result<(), Box<dyn Error + Send + Sync>> {
            Ok(())
        }
    }

    fn fast_config() -> ContextConfig {
        ContextConfig {
            barrier_poll_interval: Duration::from_millis(10),
            sweep_interval: Duration::from_millis(50),
            ..ContextConfig::default()
        }
    }

    #[test]
    fn start_gates_on_rebalance_and_serves_traffic() {
        let bus = InMemoryBus::new();
        let mut context = ServiceContext::new(fast_config(), bus);
        context.register_command_handler("DepositMoney", NoopHandler);

        context.start().unwrap();
        assert!(context.is_started());

        let handle = context
            .send(Command::new("cmd-1", "DepositMoney", Vec::new()))
            .unwrap();
        assert_eq!(
            handle.wait_timeout(Duration::from_secs(5)),
            Some(CommandOutcome::Succeeded)
        );

        context.shutdown();
        assert!(!context.is_started());
    }

    #[test]
    fn start_fails_when_rebalance_never_converges() {
        // Settle slower than the allowed wait: the barrier must time out.
        let bus = InMemoryBus::new().with_settle_delay(Duration::from_secs(60));
        let config = ContextConfig {
            barrier_poll_interval: Duration::from_millis(10),
            barrier_max_wait: Some(Duration::from_millis(100)),
            ..ContextConfig::default()
        };
        let mut context = ServiceContext::new(config, bus);

        match context.start() {
            Err(StartError::Barrier(BarrierError::TimedOut { .. })) => {}
            other => panic!("expected barrier timeout, got {:?}", other.err()),
        }
        assert!(!context.is_started());
        context.shutdown();
    }
}
