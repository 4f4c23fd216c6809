//! Environment abstraction for deterministic testing.
//!
//! The `Environment` trait decouples drivers from system resources (time,
//! randomness). The state machines in this crate never read a clock
//! themselves: every method takes `now` as a parameter, and drivers obtain
//! `now` from an `Environment`.
//!
//! The environment is implemented twice:
//!
//! 1. `SimEnv` (tessera-harness): Turmoil's virtual time and a seeded RNG
//! 2. `SystemEnv` (tessera-net): real system clock and OS entropy
//!
//! # Invariants
//!
//! - Monotonicity: `env.now()` must never go backwards
//! - Determinism: Given the same seed, `random_bytes()` produces the same
//!   sequence
//! - Isolation: Implementations must not share global state

use std::time::Duration;

/// Abstract environment providing time, randomness, and async sleep.
///
/// # Type Parameters
///
/// - `Instant`: A point in time. Both shipped implementations use
///   `std::time::Instant`; under simulation the value is derived from
///   Turmoil's virtual clock.
pub trait Environment: Clone + Send + Sync + 'static {
    /// Type representing a point in time.
    type Instant: Copy + Ord + Send + Sync + std::ops::Sub<Output = Duration>;

    /// Returns the current time. Never decreases.
    fn now(&self) -> Self::Instant;

    /// Sleeps for the specified duration.
    ///
    /// Only driver code sleeps. State machines report deadlines through
    /// `next_wakeup()` instead.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fills the provided buffer with random bytes.
    ///
    /// Deterministic for a given seed under simulation, OS entropy in
    /// production.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Generates a random `u64`.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }
}
