//! Image decoding and CLIP pixel preprocessing.
//!
//! Images are resized so the shorter side is 224 px, center-cropped to
//! 224×224, and normalized with the CLIP channel statistics into CHW order.

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use image::imageops::FilterType;
use image::DynamicImage;
use rayon::prelude::*;
use std::path::{Path, PathBuf};

pub const CLIP_IMAGE_SIZE: usize = 224;

const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];

/// Normalized `[3, size, size]` pixel values, row-major per channel.
pub fn preprocess(img: &DynamicImage, size: usize) -> Vec<f32> {
    let side = size as u32;
    let rgb = img
        .resize_to_fill(side, side, FilterType::CatmullRom)
        .to_rgb8();

    let plane = size * size;
    let mut out = vec![0f32; 3 * plane];
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let offset = y as usize * size + x as usize;
        for c in 0..3 {
            let v = pixel[c] as f32 / 255.0;
            out[c * plane + offset] = (v - CLIP_MEAN[c]) / CLIP_STD[c];
        }
    }
    out
}

/// Open and preprocess one file.
pub fn load_pixels(path: &Path, size: usize) -> Result<Vec<f32>> {
    let img = image::open(path).with_context(|| format!("Cannot decode {}", path.display()))?;
    Ok(preprocess(&img, size))
}

/// Stack preprocessed images into a `[n, 3, size, size]` tensor.
pub fn batch_tensor(images: &[Vec<f32>], size: usize, device: &Device) -> Result<Tensor> {
    let flat: Vec<f32> = images.iter().flatten().copied().collect();
    Ok(Tensor::from_vec(flat, (images.len(), 3, size, size), device)?)
}

/// Worker count used when none is configured: all cores but one.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1).max(1))
        .unwrap_or(1)
}

/// Decodes and preprocesses images on a dedicated rayon pool.
pub struct Decoder {
    pool: rayon::ThreadPool,
    size: usize,
}

impl Decoder {
    pub fn new(workers: usize, size: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("decode-{}", i))
            .build()
            .context("Failed to start image decoding pool")?;
        Ok(Self { pool, size })
    }

    /// Results keep input order. A failure for one path does not affect the
    /// others; the error text is returned in its slot.
    pub fn decode(&self, paths: &[PathBuf]) -> Vec<std::result::Result<Vec<f32>, String>> {
        let size = self.size;
        self.pool.install(|| {
            paths
                .par_iter()
                .map(|p| load_pixels(p, size).map_err(|e| format!("{:#}", e)))
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    #[test]
    fn output_is_chw_and_normalized() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(300, 200, Rgb([255, 255, 255])));
        let pixels = preprocess(&img, 8);
        assert_eq!(pixels.len(), 3 * 8 * 8);
        let expected_red = (1.0 - CLIP_MEAN[0]) / CLIP_STD[0];
        assert!((pixels[0] - expected_red).abs() < 1e-5);
        let expected_blue = (1.0 - CLIP_MEAN[2]) / CLIP_STD[2];
        assert!((pixels[2 * 64] - expected_blue).abs() < 1e-5);
    }

    #[test]
    fn batch_has_expected_shape() {
        let img = DynamicImage::ImageRgb8(RgbImage::new(10, 10));
        let one = preprocess(&img, 4);
        let t = batch_tensor(&[one.clone(), one], 4, &Device::Cpu).unwrap();
        assert_eq!(t.dims(), &[2, 3, 4, 4]);
    }

    #[test]
    fn unreadable_files_fail_individually() {
        let tmp = TempDir::new().unwrap();
        let good = tmp.path().join("good.png");
        RgbImage::new(5, 5).save(&good).unwrap();
        let bad = tmp.path().join("bad.jpg");
        std::fs::write(&bad, b"not an image").unwrap();

        let decoder = Decoder::new(2, 4).unwrap();
        let results = decoder.decode(&[good, bad]);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }
}
