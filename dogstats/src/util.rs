use std::cell::UnsafeCell;

use rand::{rngs::OsRng, Rng, SeedableRng};
use rand_xoshiro::Xoshiro256StarStar;

thread_local! {
    static FAST_RNG: UnsafeCell<Xoshiro256StarStar> = {
        UnsafeCell::new(Xoshiro256StarStar::try_from_rng(&mut OsRng).unwrap())
    };
}

fn with_rng<T>(f: impl FnOnce(&mut Xoshiro256StarStar) -> T) -> T {
    FAST_RNG.with(|rng| {
        // SAFETY: The pointer targets a thread-local value, and the mutable
        // reference created from it never outlives the closure running on
        // this thread.
        let rng = unsafe { &mut *rng.get() };
        f(rng)
    })
}

/// Draws a uniformly-random index in `0..upper`.
pub(crate) fn random_index(upper: usize) -> usize {
    with_rng(|rng| rng.random_range(0..upper))
}

/// Returns `true` with probability `rate`.
///
/// `rate` must be in `(0.0, 1.0]`; a rate of 1.0 always keeps the draw.
pub(crate) fn sample_keep(rate: f64) -> bool {
    with_rng(|rng| rng.random::<f64>() < rate)
}
