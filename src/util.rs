use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};

/// Process-wide generator, seeded once from entropy. All host-side access is
/// single threaded per the scheduling model; the mutex only provides interior
/// mutability for the shared static.
static RNG: Lazy<Mutex<StdRng>> = Lazy::new(|| Mutex::new(StdRng::from_entropy()));

pub(crate) fn with_rng<T>(f: impl FnOnce(&mut StdRng) -> T) -> T {
    f(&mut RNG.lock())
}

pub(crate) fn uniform(min: crate::Float, max: crate::Float) -> crate::Float {
    with_rng(|rng| rng.gen_range(min..=max))
}

/// Work groups needed to cover `n` items at `group_size` items per group.
pub(crate) const fn work_groups(n: u32, group_size: u32) -> u32 {
    (n + group_size - 1) / group_size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_groups_rounds_up() {
        assert_eq!(work_groups(1, 8), 1);
        assert_eq!(work_groups(8, 8), 1);
        assert_eq!(work_groups(9, 8), 2);
        assert_eq!(work_groups(64, 8), 8);
    }

    #[test]
    fn uniform_stays_in_range() {
        for _ in 0..1000 {
            let x = uniform(-1., 1.);
            assert!((-1. ..=1.).contains(&x));
        }
    }
}
