use burn::{
    nn::{
        LeakyRelu, LeakyReluConfig, Linear, LinearConfig, PaddingConfig2d, Relu, Sigmoid,
        conv::{Conv2d, Conv2dConfig},
    },
    prelude::*,
};

use crate::model::constants::{CHANNELS, HEIGHT, LATENT_DIM, WIDTH};

#[derive(Module, Debug)]
pub struct Generator<B: Backend> {
    linear1: Linear<B>,
    linear2: Linear<B>,
    linear3: Linear<B>,
    linear4: Linear<B>,
    linear5: Linear<B>,
    activation: LeakyRelu,
    activation_final: Sigmoid,
}

#[derive(Config, Debug)]
pub struct GeneratorConfig {
    #[config(default = "LATENT_DIM")]
    pub latent_dim: usize,
    #[config(default = "0.01")]
    pub leaky_relu_slope: f64,
}

#[derive(Module, Debug)]
pub struct Discriminator<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    conv3: Conv2d<B>,
    conv4: Conv2d<B>,
    conv5: Conv2d<B>,
    activation: Relu,
    activation_final: Sigmoid,
}

#[derive(Config, Debug)]
pub struct DiscriminatorConfig {
    /// Channels of the first convolution; each following stride-2 stage doubles it.
    #[config(default = 64)]
    pub base_channels: usize,
}

impl GeneratorConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Generator<B> {
        Generator {
            linear1: LinearConfig::new(self.latent_dim, 256).init(device),
            linear2: LinearConfig::new(256, 512).init(device),
            linear3: LinearConfig::new(512, 64).init(device),
            linear4: LinearConfig::new(64, 64).init(device),
            linear5: LinearConfig::new(64, CHANNELS * HEIGHT * WIDTH).init(device),
            activation: LeakyReluConfig::new()
                .with_negative_slope(self.leaky_relu_slope)
                .init(),
            activation_final: Sigmoid::new(),
        }
    }
}

impl DiscriminatorConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Discriminator<B> {
        let c = self.base_channels;
        Discriminator {
            conv1: Conv2dConfig::new([CHANNELS, c], [4, 4])
                .with_stride([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device), // 64 -> 32
            conv2: Conv2dConfig::new([c, c * 2], [6, 6])
                .with_stride([2, 2])
                .with_padding(PaddingConfig2d::Explicit(2, 2))
                .init(device), // 32 -> 16
            conv3: Conv2dConfig::new([c * 2, c * 4], [2, 2])
                .with_stride([2, 2])
                .with_padding(PaddingConfig2d::Valid)
                .init(device), // 16 -> 8
            conv4: Conv2dConfig::new([c * 4, c * 8], [4, 4])
                .with_stride([2, 2])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .init(device), // 8 -> 4
            conv5: Conv2dConfig::new([c * 8, 1], [4, 4])
                .with_padding(PaddingConfig2d::Valid)
                .init(device), // 4 -> 1
            activation: Relu,
            activation_final: Sigmoid::new(),
        }
    }
}

impl<B: Backend> Generator<B> {
    /// Maps `[batch, latent_dim]` noise to `[batch, 3, 64, 64]` images in [0, 1].
    pub fn forward(&self, input: Tensor<B, 2>) -> Tensor<B, 4> {
        let mut x = self.linear1.forward(input);
        x = self.activation.forward(x);
        x = self.linear2.forward(x);
        x = self.activation.forward(x);
        x = self.linear3.forward(x);
        x = self.activation.forward(x);
        x = self.linear4.forward(x);
        x = self.activation.forward(x);
        x = self.linear5.forward(x);
        x = self.activation_final.forward(x);
        x.reshape([-1, CHANNELS as i32, HEIGHT as i32, WIDTH as i32])
    }
}

impl<B: Backend> Discriminator<B> {
    /// Scores `[batch, 3, 64, 64]` images, returning `[batch, 1]` probabilities.
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 2> {
        let mut x = self.conv1.forward(input);
        x = self.activation.forward(x);
        x = self.conv2.forward(x);
        x = self.activation.forward(x);
        x = self.conv3.forward(x);
        x = self.activation.forward(x);
        x = self.conv4.forward(x);
        x = self.activation.forward(x);
        x = self.conv5.forward(x);
        x = self.activation_final.forward(x);
        x.flatten(1, 3)
    }
}
