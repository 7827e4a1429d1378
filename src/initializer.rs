use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Source of initial parameter values. Layers request values one at a time
/// in the order they lay out their parameters.
pub trait Initializer {
    /// Draw a value from the uniform distribution over `[low, high)`.
    fn uniform(&mut self, low: f32, high: f32) -> f32;
}

impl<T: Initializer + ?Sized> Initializer for &mut T {
    fn uniform(&mut self, low: f32, high: f32) -> f32 {
        (**self).uniform(low, high)
    }
}

/// Seeded pseudo-random initialization. The same seed always produces the
/// same parameters, regardless of which backend consumes them.
#[derive(Debug, Clone)]
pub struct UniformInit {
    rng: SmallRng,
}

impl UniformInit {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
        }
    }
}

impl Initializer for UniformInit {
    fn uniform(&mut self, low: f32, high: f32) -> f32 {
        if low < high {
            self.rng.gen_range(low, high)
        } else {
            low
        }
    }
}

/// This initializer accepts an iterator over f32 values and uses them to initialize the weights,
/// ignoring the requested range. Panics if a weight is requested but the iterator returns None.
pub struct WeightInit<T: Iterator<Item = f32>> {
    iter: T,
}

impl<I: Iterator<Item = f32>> WeightInit<I> {
    pub fn new<T: IntoIterator<Item = f32, IntoIter = I>>(weights: T) -> Self {
        Self {
            iter: weights.into_iter(),
        }
    }
}

impl<I: Iterator<Item = f32>> Initializer for WeightInit<I> {
    fn uniform(&mut self, _low: f32, _high: f32) -> f32 {
        self.iter.next().expect("Ran out of weights")
    }
}
