use image::{DynamicImage, RgbImage, imageops, imageops::FilterType};
use rand::Rng;

use crate::model::constants::CHANNELS;

/// Resizes so that the shorter edge equals `size`, keeping the aspect ratio.
/// The longer edge is truncated, e.g. 178x218 becomes 70x85.
pub fn resize_shorter_edge(image: &DynamicImage, size: u32) -> RgbImage {
    let (width, height) = (image.width(), image.height());
    let (new_width, new_height) = if width <= height {
        (size, (size as u64 * height as u64 / width as u64) as u32)
    } else {
        ((size as u64 * width as u64 / height as u64) as u32, size)
    };
    if (new_width, new_height) == (width, height) {
        return image.to_rgb8();
    }
    image
        .resize_exact(new_width, new_height, FilterType::Triangle)
        .to_rgb8()
}

/// Crops the middle; a half-pixel offset rounds to even (85 rows -> offset 10).
pub fn center_crop(image: &RgbImage, width: u32, height: u32) -> RgbImage {
    let x = (image.width().saturating_sub(width) as f32 / 2.0).round_ties_even() as u32;
    let y = (image.height().saturating_sub(height) as f32 / 2.0).round_ties_even() as u32;
    imageops::crop_imm(image, x, y, width, height).to_image()
}

pub fn random_crop<R: Rng + ?Sized>(
    image: &RgbImage,
    width: u32,
    height: u32,
    rng: &mut R,
) -> RgbImage {
    let x = rng.random_range(0..=image.width().saturating_sub(width));
    let y = rng.random_range(0..=image.height().saturating_sub(height));
    imageops::crop_imm(image, x, y, width, height).to_image()
}

pub fn random_horizontal_flip<R: Rng + ?Sized>(
    image: RgbImage,
    probability: f64,
    rng: &mut R,
) -> RgbImage {
    if rng.random_bool(probability) {
        imageops::flip_horizontal(&image)
    } else {
        image
    }
}

/// Converts an RGB image into a channel-major buffer normalized to [-1, 1]
/// (mean 0.5 and std 0.5 on every channel).
pub fn rgb_to_normalized_chw(image: &RgbImage) -> Vec<f32> {
    let plane = (image.width() * image.height()) as usize;
    let mut data = vec![0.0f32; CHANNELS * plane];
    for (i, pixel) in image.pixels().enumerate() {
        for c in 0..CHANNELS {
            // (x / 255 - 0.5) / 0.5
            data[c * plane + i] = (pixel[c] as f32 / 255.0 - 0.5) / 0.5;
        }
    }
    data
}
