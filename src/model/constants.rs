pub const CHANNELS: usize = 3;
pub const HEIGHT: usize = 64;
pub const WIDTH: usize = 64;

/// Shorter image edge after the resize step, before cropping to `HEIGHT`x`WIDTH`.
pub const RESIZE: u32 = 70;

pub const LATENT_DIM: usize = 100;

/// Number of sorted files that go to the training split; the rest is evaluation.
pub const TRAIN_SIZE: usize = 10_000;
