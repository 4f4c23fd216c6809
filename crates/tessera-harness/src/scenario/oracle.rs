//! Oracle functions for scenario verification.
//!
//! Oracles run at the end of a scenario with the whole world in view and
//! return `Err` with a description when an invariant does not hold.

use tessera_core::connection::ConnectionPhase;

use crate::scenario::{Side, World};

/// Oracle function type.
pub type OracleFn = Box<dyn FnOnce(&World) -> Result<(), String>>;

/// Both ends are connected.
pub fn all_connected() -> OracleFn {
    Box::new(|world| {
        for side in [Side::Client, Side::Server] {
            let phase = world.connection(side).phase();
            if phase != ConnectionPhase::Connected {
                return Err(format!("{side:?} is {phase:?}, expected Connected"));
            }
        }
        Ok(())
    })
}

/// Both ends settled on identical capabilities.
pub fn capabilities_agree() -> OracleFn {
    Box::new(|world| {
        match (world.connection(Side::Client).negotiated(), world.connection(Side::Server).negotiated()) {
            (Some(client), Some(server)) if client == server => Ok(()),
            (client, server) => Err(format!("capabilities differ: client {client:?}, server {server:?}")),
        }
    })
}

/// Both ends are failed or closed and reported why.
pub fn all_closed() -> OracleFn {
    Box::new(|world| {
        for side in [Side::Client, Side::Server] {
            if !world.connection(side).phase().is_terminal() {
                return Err(format!("{side:?} still {:?}", world.connection(side).phase()));
            }
            if world.close_reason(side).is_none() {
                return Err(format!("{side:?} closed without a reason"));
            }
        }
        Ok(())
    })
}

/// Combine multiple oracles into one.
pub fn all_of(oracles: Vec<OracleFn>) -> OracleFn {
    Box::new(move |world| {
        for oracle in oracles {
            oracle(world)?;
        }
        Ok(())
    })
}
