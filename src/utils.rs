use std::fmt;

pub(crate) type BuildHasher = fxhash::FxBuildHasher;
pub(crate) type HashMap<K, V, B = BuildHasher> = std::collections::HashMap<K, V, B>;
pub(crate) type HashSet<K, B = BuildHasher> = std::collections::HashSet<K, B>;
pub(crate) type Instant = quanta::Instant;

pub(crate) fn hashmap_with_capacity<K, V>(cap: usize) -> HashMap<K, V> {
    HashMap::with_capacity_and_hasher(cap, BuildHasher::default())
}

/// Sample from the shifted geometric distribution `P(k) = (1-p)^k * p`
/// given a uniform draw `u` in `[0, 1)`.
///
/// Used by the stochastic scheduler to turn rule priorities into sampling
/// probabilities.
pub fn sample_shifted_geometric(u: f64, p: f64) -> usize {
    debug_assert!((0.0..1.0).contains(&u));
    debug_assert!(p > 0.0 && p < 1.0);
    let k = (1.0 - u).ln() / (1.0 - p).ln();
    if k.is_finite() && k >= 0.0 {
        k as usize
    } else {
        0
    }
}

/// A seedable, splittable source of uniform doubles in `[0, 1)`.
///
/// The engine never constructs one itself; stochastic strategies take
/// whatever the host hands them.
pub trait RandomSource {
    fn next_double(&mut self) -> f64;

    /// Derive an independent stream, e.g. for a parallel sub-search.
    fn split(&mut self) -> Self
    where
        Self: Sized;
}

impl RandomSource for rand::rngs::SmallRng {
    fn next_double(&mut self) -> f64 {
        use rand::Rng;
        self.gen::<f64>()
    }

    fn split(&mut self) -> Self {
        use rand::{Rng, SeedableRng};
        Self::seed_from_u64(self.gen())
    }
}

/// Write `items` between `open` and `close`, comma-separated.
pub(crate) fn write_delimited<T, F>(
    f: &mut fmt::Formatter<'_>,
    open: &str,
    close: &str,
    items: impl IntoIterator<Item = T>,
    mut write_item: F,
) -> fmt::Result
where
    F: FnMut(&mut fmt::Formatter<'_>, T) -> fmt::Result,
{
    f.write_str(open)?;
    for (i, item) in items.into_iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write_item(f, item)?;
    }
    f.write_str(close)
}
