use burn::prelude::*;
use image::{imageops::FilterType, DynamicImage, ImageFormat, Rgb, RgbImage};
use std::{io::Cursor, path::Path};

use crate::error::Result;

/// Maps a pixel from [0, 255] to [-1, 1]. Training and serving both go
/// through here so the two sides can never disagree.
pub fn normalize_pixel(value: u8) -> f32 {
    (value as f32 / 127.5) - 1.0
}

/// Inverse of `normalize_pixel`, clamped to the valid pixel range.
pub fn denormalize_pixel(value: f32) -> u8 {
    ((value + 1.0) * 127.5).clamp(0.0, 255.0).round() as u8
}

/// Resizes to the network resolution and drops any alpha channel.
pub fn prepare_image(image: &DynamicImage, height: usize, width: usize) -> RgbImage {
    image
        .resize_exact(width as u32, height as u32, FilterType::CatmullRom)
        .to_rgb8()
}

/// `[height, width, 3]` pixels to a normalized `[3, height, width]` tensor.
pub fn image_to_tensor<B: Backend>(image: &RgbImage, device: &B::Device) -> Tensor<B, 3> {
    let (width, height) = image.dimensions();
    let values = image
        .as_raw()
        .iter()
        .map(|&value| normalize_pixel(value))
        .collect::<Vec<_>>();

    Tensor::<B, 3>::from_data(
        TensorData::new(values, [height as usize, width as usize, 3]),
        device,
    )
    .permute([2, 0, 1])
}

/// Normalized `[3, height, width]` tensor back to pixels.
pub fn tensor_to_image<B: Backend>(tensor: Tensor<B, 3>) -> RgbImage {
    let [_, height, width] = tensor.dims();
    let values = tensor
        .permute([1, 2, 0])
        .into_data()
        .iter::<f32>()
        .map(denormalize_pixel)
        .collect::<Vec<_>>();

    RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let i = (y as usize * width + x as usize) * 3;
        Rgb([values[i], values[i + 1], values[i + 2]])
    })
}

pub fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>> {
    let mut bytes = Cursor::new(Vec::new());
    image.write_to(&mut bytes, ImageFormat::Jpeg)?;

    Ok(bytes.into_inner())
}

/// Saves `(photo, painting)` pairs as one image, one pair per row.
pub fn save_mosaic<Q: AsRef<Path>>(pairs: &[(RgbImage, RgbImage)], path: Q) -> Result<()> {
    let Some((first, _)) = pairs.first() else {
        return Ok(());
    };
    let (width, height) = first.dimensions();

    let mut canvas = RgbImage::new(width * 2, height * pairs.len() as u32);
    for (row, (photo, painting)) in pairs.iter().enumerate() {
        let y = (row as u32 * height) as i64;
        image::imageops::replace(&mut canvas, photo, 0, y);
        image::imageops::replace(&mut canvas, painting, width as i64, y);
    }
    canvas.save(path)?;

    Ok(())
}
