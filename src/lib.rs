//! Reliable asynchronous command execution over a pub/sub message bus.
//!
//! Commands are fire-and-forget on the wire but request/response at the
//! API: callers send a [`Command`] and get back a [`CommandHandle`] that
//! completes when a result event correlated to the command id comes back
//! on the event topic. Around that core sit an ordered event pipeline
//! (publisher and consumer), a completed-command processor that closes
//! the correlation loop, and a rebalance barrier that gates startup until
//! every consumer group owns its full queue set.
//!
//! [`ServiceContext`] wires all of it over one [`bus::MessageBus`]; the
//! bundled [`bus::InMemoryBus`] covers tests and local development.

pub mod barrier;
pub mod bus;
pub mod command;
pub mod completion;
pub mod config;
pub mod event;

mod context;

pub use barrier::{BarrierError, BarrierState, RebalanceBarrier};
pub use bus::{
    InMemoryBus, Message, MessageBus, PublishError, QueueAssignments, QueueId, Subscription,
};
pub use command::{
    Command, CommandConsumer, CommandHandle, CommandHandler, CommandOutcome, CommandService,
    PendingCommands, SendError,
};
pub use completion::{CompletedCommandProcessor, ProcessorStats};
pub use config::{ConsumerSettings, ContextConfig, HandleMode};
pub use context::{ServiceContext, StartError};
pub use event::{
    CommandResult, DomainEvent, EventConsumer, EventError, EventHandler, EventPublisher,
};
