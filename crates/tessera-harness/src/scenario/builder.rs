//! Scenario builder API.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use tessera_core::{
    TransportError,
    connection::{Connection, ConnectionAction, ConnectionConfig},
    wire_format::WireFormatCapabilities,
};
use tessera_proto::{Payload, payloads::message::Message};

use crate::scenario::{OracleFn, Side, World};

/// Upper bound on timer steps in one time advance.
const MAX_STEPS: usize = 100_000;

/// Scenario builder.
///
/// Configure both ends, optionally queue messages, cut the link or advance
/// time, then add the oracle.
pub struct Scenario {
    client_config: ConnectionConfig,
    server_config: ConnectionConfig,
    messages: Vec<Message>,
    partition: bool,
    time_advance: Option<Duration>,
}

impl Scenario {
    /// Both ends with default configuration.
    pub fn new() -> Self {
        Self {
            client_config: ConnectionConfig::default(),
            server_config: ConnectionConfig::default(),
            messages: Vec::new(),
            partition: false,
            time_advance: None,
        }
    }

    /// Configure the client connection.
    pub fn with_client_config(mut self, config: ConnectionConfig) -> Self {
        self.client_config = config;
        self
    }

    /// Configure the server connection.
    pub fn with_server_config(mut self, config: ConnectionConfig) -> Self {
        self.server_config = config;
        self
    }

    /// Preferred capabilities of the client.
    pub fn with_client_wire_format(mut self, wire_format: WireFormatCapabilities) -> Self {
        self.client_config.wire_format = wire_format;
        self
    }

    /// Preferred capabilities of the server.
    pub fn with_server_wire_format(mut self, wire_format: WireFormatCapabilities) -> Self {
        self.server_config.wire_format = wire_format;
        self
    }

    /// Client sends `message` right after negotiation.
    pub fn with_client_message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    /// Drop every frame after negotiation, in both directions.
    pub fn with_partition(mut self) -> Self {
        self.partition = true;
        self
    }

    /// Advance virtual time after negotiation, firing every timer on the
    /// way.
    pub fn with_time_advance(mut self, duration: Duration) -> Self {
        self.time_advance = Some(duration);
        self
    }

    /// Set the oracle. A scenario cannot run without one.
    pub fn oracle(self, oracle: OracleFn) -> RunnableScenario {
        RunnableScenario { scenario: self, oracle }
    }
}

impl Default for Scenario {
    fn default() -> Self {
        Self::new()
    }
}

/// A scenario with an oracle function that can be executed.
pub struct RunnableScenario {
    scenario: Scenario,
    oracle: OracleFn,
}

impl RunnableScenario {
    /// Execute the scenario and run the oracle on the final world.
    ///
    /// # Errors
    ///
    /// Returns the oracle's error, or a description of a harness failure
    /// (a message that could not be sent, a timer that never settles).
    pub fn run(self) -> Result<(), String> {
        let start = Instant::now();
        let Scenario { client_config, server_config, messages, partition, time_advance } =
            self.scenario;

        let mut world =
            World::new(Connection::new(start, client_config), Connection::new(start, server_config));

        let mut pending = VecDeque::new();
        for side in [Side::Client, Side::Server] {
            let actions = world
                .connection_mut(side)
                .start(start)
                .map_err(|e| format!("{side:?} failed to start: {e}"))?;
            pending.extend(actions.into_iter().map(|action| (side, action)));
        }
        exchange(&mut world, pending, start);

        for message in messages {
            let frame = Payload::Message(message)
                .to_frame()
                .map_err(|e| format!("cannot encode message: {e}"))?;
            let frame = world
                .connection_mut(Side::Client)
                .send(frame, start)
                .map_err(|e| format!("client cannot send: {e}"))?;
            exchange(&mut world, VecDeque::from([(Side::Client, ConnectionAction::SendFrame(frame))]), start);
        }

        if partition {
            world.partition();
        }

        if let Some(advance) = time_advance {
            advance_time(&mut world, start + advance)?;
        }

        (self.oracle)(&world)
    }
}

/// Fire every timer due up to `end`, in deadline order.
fn advance_time(world: &mut World, end: Instant) -> Result<(), String> {
    for _ in 0..MAX_STEPS {
        let next = [Side::Client, Side::Server]
            .into_iter()
            .filter_map(|side| world.connection(side).next_wakeup())
            .min();
        let now = match next {
            Some(at) if at <= end => at,
            _ => {
                tick(world, end);
                return Ok(());
            },
        };
        tick(world, now);
    }
    Err(format!("timers did not settle within {MAX_STEPS} steps"))
}

fn tick(world: &mut World, now: Instant) {
    let mut pending = VecDeque::new();
    for side in [Side::Client, Side::Server] {
        let actions = world.connection_mut(side).tick(now);
        pending.extend(actions.into_iter().map(|action| (side, action)));
    }
    exchange(world, pending, now);
}

/// Execute actions until quiescent. Frames are delivered instantly unless
/// the link is cut.
fn exchange(world: &mut World, mut pending: VecDeque<(Side, ConnectionAction)>, now: Instant) {
    while let Some((side, action)) = pending.pop_front() {
        match action {
            ConnectionAction::SendFrame(frame) => {
                world.record_sent(side);
                if world.is_partitioned() {
                    world.record_dropped(side);
                    continue;
                }
                let peer = side.peer();
                if world.connection(peer).phase().is_terminal() {
                    continue;
                }
                world.record_received(peer);
                match world.connection_mut(peer).handle_frame(&frame, now) {
                    Ok(actions) => pending.extend(actions.into_iter().map(|action| (peer, action))),
                    Err(err) => {
                        world.connection_mut(peer).fail();
                        world.record_close(peer, err);
                    },
                }
            },
            ConnectionAction::Established(caps) => world.record_established(side, caps),
            ConnectionAction::Deliver(frame) => world.record_delivered(side, frame),
            ConnectionAction::Close { error } => {
                world.record_close(side, error.unwrap_or(TransportError::Closed));
            },
        }
    }
}
