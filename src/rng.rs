/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

/*
 * The random oracle the skip list draws node heights from.
 *
 * The core never seeds, stores, or otherwise owns a PRNG implementation,
 * that stays the embedder's problem, consumed through a trait rather
 * than a concrete generator. Pool is generic over R: RandomSource so the
 * call is monomorphized away rather than going through a vtable.
 */

/* A source of 64-bit random words, consumed once per skip-list
 * chain-head insertion to pick that node's height. */
pub trait RandomSource {
    fn next_random_u64(&mut self) -> u64;
}

impl<F: FnMut() -> u64> RandomSource for F {
    fn next_random_u64(&mut self) -> u64 {
        (self)()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::RandomSource;
    use rand::RngCore;
    use rand_chacha::rand_core::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    /* Deterministic PRNG for reproducible skip-list height sequences in
     * tests. */
    pub struct ChaChaRandomSource(ChaCha8Rng);

    impl ChaChaRandomSource {
        pub fn seeded(seed: u64) -> Self {
            Self(ChaCha8Rng::seed_from_u64(seed))
        }
    }

    impl RandomSource for ChaChaRandomSource {
        fn next_random_u64(&mut self) -> u64 {
            self.0.next_u64()
        }
    }
}
