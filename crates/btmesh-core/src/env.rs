//! Environment abstraction for deterministic testing.
//!
//! Everything nondeterministic the core needs (the monotonic clock, sleeping
//! and randomness) goes through [`Environment`]. Production uses
//! [`SystemEnv`]; the simulation harness supplies a seeded implementation so
//! whole scenarios replay bit for bit.

use std::{
    future::Future,
    time::{Duration, Instant},
};

/// Source of time and randomness.
pub trait Environment: Clone + Send + Sync + 'static {
    /// Current monotonic time.
    fn now(&self) -> Instant;

    /// Sleep for `duration`.
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;

    /// Fill `buffer` with random bytes.
    ///
    /// Key material is drawn from here, so production implementations must
    /// use a cryptographically secure generator.
    fn random_bytes(&self, buffer: &mut [u8]);
}

/// Draw a fresh 128-bit key.
pub fn random_key<E: Environment>(env: &E) -> [u8; 16] {
    let mut key = [0u8; 16];
    env.random_bytes(&mut key);
    key
}

/// Draw a random version 4 UUID.
pub fn random_uuid<E: Environment>(env: &E) -> uuid::Uuid {
    uuid::Builder::from_random_bytes(random_key(env)).into_uuid()
}

/// Environment backed by the operating system.
///
/// The clock is tokio's, so a runtime with paused time moves `now` and
/// `sleep` together.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl Environment for SystemEnv {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        use rand::RngCore;
        rand::rngs::OsRng.fill_bytes(buffer);
    }
}
