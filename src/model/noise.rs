use burn::prelude::*;
use rand::{Rng, SeedableRng, rngs::StdRng};
use rand_distr::StandardNormal;

/// Draws a `[batch_size, noise_size]` standard normal tensor.
///
/// The generator is reseeded with `seed + 1` before drawing and that value is
/// returned as the next seed, so a given input seed always yields the same
/// noise, across runs and regardless of any other random state.
pub fn generate_noise<B: Backend>(
    batch_size: usize,
    noise_size: usize,
    seed: u64,
    device: &B::Device,
) -> (Tensor<B, 2>, u64) {
    let seed = seed.wrapping_add(1);
    let mut rng = StdRng::seed_from_u64(seed);
    let values: Vec<f32> = (0..batch_size * noise_size)
        .map(|_| rng.sample(StandardNormal))
        .collect();
    let noise = Tensor::<B, 2>::from_data(
        TensorData::new(values, [batch_size, noise_size]).convert::<B::FloatElem>(),
        device,
    );
    (noise, seed)
}

/// Owns the seed counter that successive noise draws are threaded through.
#[derive(Debug, Clone)]
pub struct NoiseSource {
    seed: u64,
    noise_size: usize,
}

impl NoiseSource {
    pub fn new(seed: u64, noise_size: usize) -> Self {
        Self { seed, noise_size }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn next<B: Backend>(&mut self, batch_size: usize, device: &B::Device) -> Tensor<B, 2> {
        let (noise, seed) = generate_noise(batch_size, self.noise_size, self.seed, device);
        self.seed = seed;
        noise
    }
}
