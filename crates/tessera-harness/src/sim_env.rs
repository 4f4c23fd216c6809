//! [`Environment`] for turmoil hosts.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use tessera_core::env::Environment;

/// Simulation environment using turmoil's virtual time and a seeded RNG.
///
/// - **Virtual time**: `now()` reads the host's tokio clock, which turmoil
///   advances instantly while every task is idle.
/// - **Seeded RNG**: `random_bytes()` draws from ChaCha20 seeded with a
///   fixed value, so failover candidate shuffles repeat exactly.
///
/// Clones share one RNG; a broker and every task it spawns see a single
/// sequence.
///
/// # Panics
///
/// `now()` and `sleep()` panic outside a tokio runtime.
#[derive(Clone)]
pub struct SimEnv {
    rng: Arc<Mutex<ChaCha20Rng>>,
}

impl SimEnv {
    /// Environment seeded with 0.
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    /// Environment with a specific seed.
    pub fn with_seed(seed: u64) -> Self {
        Self { rng: Arc::new(Mutex::new(ChaCha20Rng::seed_from_u64(seed))) }
    }
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment for SimEnv {
    type Instant = std::time::Instant;

    fn now(&self) -> Self::Instant {
        tokio::time::Instant::now().into_std()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.rng.lock().unwrap_or_else(PoisonError::into_inner).fill_bytes(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleeping_advances_virtual_time() {
        let mut sim = turmoil::Builder::new().build();

        sim.client("test", async {
            let env = SimEnv::new();

            let before = env.now();
            env.sleep(Duration::from_secs(90)).await;
            assert_eq!(env.now() - before, Duration::from_secs(90));
            Ok(())
        });

        sim.run().expect("simulation failed");
    }

    #[test]
    fn same_seed_same_bytes() {
        let draw = |seed: u64| {
            let env = SimEnv::with_seed(seed);
            let mut drawn = [0u8; 32];
            env.random_bytes(&mut drawn);
            drawn
        };

        assert_eq!(draw(12345), draw(12345));
        assert_ne!(draw(12345), draw(54321));
    }

    #[test]
    fn clones_share_rng_state() {
        let original = SimEnv::with_seed(999);
        let clone = original.clone();

        assert_ne!(original.random_u64(), clone.random_u64());
    }
}
