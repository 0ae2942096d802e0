mod support;

use std::sync::Arc;
use std::time::{Duration, Instant};

use dispatched::{
    BarrierError, BarrierState, Command, CommandOutcome, ContextConfig, InMemoryBus,
    MessageBus, QueueAssignments, RebalanceBarrier, ServiceContext, StartError,
};
use support::bank::DepositHandler;
use support::init_tracing;

const POLL: Duration = Duration::from_millis(10);

#[test]
fn barrier_releases_once_every_group_owns_its_queues() {
    init_tracing();
    // Assignments settle over 150ms, so the first polls see partial
    // ownership for all three groups.
    let bus = InMemoryBus::new().with_settle_delay(Duration::from_millis(150));
    let _commands = bus.subscribe("command-consumer", "commands").unwrap();
    let _events = bus.subscribe("event-consumer", "events").unwrap();
    let _results = bus.subscribe("completed-command-processor", "events").unwrap();

    let assignments: Arc<dyn QueueAssignments> = Arc::new(bus);
    let mut barrier = RebalanceBarrier::new(assignments, POLL)
        .track("command-consumer", 4)
        .track("event-consumer", 4)
        .track("completed-command-processor", 4);

    let started = Instant::now();
    barrier.start();
    assert_eq!(barrier.state(), BarrierState::Polling);

    barrier.wait_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(barrier.state(), BarrierState::Ready);
    assert!(
        started.elapsed() >= Duration::from_millis(150),
        "barrier released before assignments settled"
    );

    let polls = barrier.stop();
    assert!(polls >= 2, "expected repeated polling, got {} polls", polls);
}

#[test]
fn barrier_times_out_when_a_group_never_joins() {
    init_tracing();
    let bus = InMemoryBus::new();
    let _commands = bus.subscribe("command-consumer", "commands").unwrap();
    // "event-consumer" never subscribes, so it owns nothing forever.

    let assignments: Arc<dyn QueueAssignments> = Arc::new(bus);
    let mut barrier = RebalanceBarrier::new(assignments, POLL)
        .track("command-consumer", 4)
        .track("event-consumer", 4);
    barrier.start();

    match barrier.wait_timeout(Duration::from_millis(200)) {
        Err(BarrierError::TimedOut { waited }) => {
            assert!(waited >= Duration::from_millis(200));
        }
        Ok(()) => panic!("barrier should not have released"),
    }
    assert_eq!(barrier.state(), BarrierState::Polling);
    barrier.stop();
}

#[test]
fn context_start_blocks_until_rebalance_settles() {
    init_tracing();
    let settle = Duration::from_millis(200);
    let bus = InMemoryBus::new().with_settle_delay(settle);
    let config = ContextConfig {
        barrier_poll_interval: POLL,
        sweep_interval: Duration::from_millis(50),
        ..ContextConfig::default()
    };
    let mut context = ServiceContext::new(config, bus);
    context.register_command_handler("DepositMoney", DepositHandler::new(context.event_publisher()));

    let started = Instant::now();
    context.start().unwrap();
    assert!(
        started.elapsed() >= settle,
        "start returned before groups finished rebalancing"
    );

    // Traffic flows normally once released.
    let command = Command::encode(
        "cmd-1",
        "DepositMoney",
        &support::bank::Deposit {
            account_id: "acct-a".to_string(),
            amount: 10,
        },
    )
    .unwrap();
    let handle = context.send(command).unwrap();
    assert_eq!(
        handle.wait_timeout(Duration::from_secs(5)),
        Some(CommandOutcome::Succeeded)
    );

    context.shutdown();
}

#[test]
fn context_start_surfaces_barrier_timeout() {
    init_tracing();
    let bus = InMemoryBus::new().with_settle_delay(Duration::from_secs(120));
    let config = ContextConfig {
        barrier_poll_interval: POLL,
        barrier_max_wait: Some(Duration::from_millis(150)),
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
