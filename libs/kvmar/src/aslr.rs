// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use rand::Rng;
use rand::distr::Uniform;
use rand_chacha::ChaCha20Rng;

/// The per-address-space randomness source for address space layout randomization.
///
/// ASLR is enabled iff the randomizer was constructed with an rng. All draws happen while the owning
/// address space's lock is held, so the sequence of placements is reproducible for a fixed seed and
/// a fixed sequence of operations.
#[derive(Debug)]
pub struct Randomizer {
    rng: Option<ChaCha20Rng>,
}

impl Randomizer {
    pub const fn new(rng: Option<ChaCha20Rng>) -> Self {
        Self { rng }
    }

    pub const fn is_enabled(&self) -> bool {
        self.rng.is_some()
    }

    /// Draws an index uniformly from `0..n`.
    ///
    /// Returns `None` if ASLR is disabled or `n` is zero.
    pub fn next_uniform(&mut self, n: usize) -> Option<usize> {
        let distr = Uniform::new(0, n).ok()?;
        self.rng.as_mut().map(|rng| rng.sample(distr))
    }

    /// Draws one uniformly distributed byte, or `None` if ASLR is disabled.
    pub fn next_byte(&mut self) -> Option<u8> {
        self.rng.as_mut().map(|rng| rng.random::<u8>())
    }
}
