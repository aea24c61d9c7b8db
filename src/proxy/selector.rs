//! Weighted random subset selection.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::store::{WeightedRoute, TOTAL_WEIGHT};

/// Picks a subset from a weighted split with a uniform draw in `[0, 100)`.
///
/// By default each thread draws from its own thread-local generator.
/// A seeded selector shares one generator behind a mutex, which makes
/// sequences reproducible in tests.
pub struct WeightedSelector {
    seeded: Option<Mutex<StdRng>>,
}

impl WeightedSelector {
    /// Creates a selector backed by the thread-local generator.
    pub fn new() -> Self {
        Self { seeded: None }
    }

    /// Creates a selector with a deterministic generator.
    pub fn seeded(seed: u64) -> Self {
        Self {
            seeded: Some(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }

    /// Selects the subset for one request.
    pub fn select<'a>(&self, route: &'a WeightedRoute) -> &'a str {
        route.pick(self.draw())
    }

    fn draw(&self) -> u32 {
        match &self.seeded {
            Some(rng) => rng.lock().gen_range(0..TOTAL_WEIGHT),
            None => rand::thread_rng().gen_range(0..TOTAL_WEIGHT),
        }
    }
}

impl Default for WeightedSelector {
    fn default() -> Self {
        Self::new()
    }
}
