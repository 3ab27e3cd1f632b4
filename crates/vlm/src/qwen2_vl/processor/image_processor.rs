use crate::GridThw;
use anyhow::bail;
use candle_core::{DType, Device, Tensor};
use image::{DynamicImage, GenericImageView};
use serde::Deserialize;

/// Side length both image dimensions are snapped to: `patch_size * merge_size`.
pub const IMAGE_FACTOR: u32 = 28;
pub const MAX_RATIO: u32 = 200;

/// Returns `(height, width)` rounded to multiples of `factor`, scaled so the
/// pixel count stays within `[min_pixels, max_pixels]` and the aspect ratio
/// is roughly kept.
pub fn smart_resize(
    height: u32,
    width: u32,
    factor: u32,
    min_pixels: u32,
    max_pixels: u32,
) -> anyhow::Result<(u32, u32)> {
    if height < factor || width < factor {
        bail!(
            "height:{} or width:{} must be larger than factor:{}",
            height,
            width,
            factor
        );
    }
    let ratio = height.max(width) as f64 / height.min(width) as f64;
    if ratio > MAX_RATIO as f64 {
        bail!(
            "absolute aspect ratio must be smaller than {}, got {}",
            MAX_RATIO,
            ratio
        );
    }

    let (h, w, f) = (height as f64, width as f64, factor as f64);
    let round_by_factor = |x: f64| (x / f).round_ties_even() * f;
    let floor_by_factor = |x: f64| (x / f).floor() * f;
    let ceil_by_factor = |x: f64| (x / f).ceil() * f;

    let mut h_bar = round_by_factor(h).max(f);
    let mut w_bar = round_by_factor(w).max(f);
    if h_bar * w_bar > max_pixels as f64 {
        let beta = (h * w / max_pixels as f64).sqrt();
        h_bar = floor_by_factor(h / beta).max(f);
        w_bar = floor_by_factor(w / beta).max(f);
    } else if h_bar * w_bar < min_pixels as f64 {
        let beta = (min_pixels as f64 / (h * w)).sqrt();
        h_bar = ceil_by_factor(h * beta);
        w_bar = ceil_by_factor(w * beta);
    }
    Ok((h_bar as u32, w_bar as u32))
}

/// `preprocessor_config.json` of a Qwen2-VL checkpoint.
#[derive(Deserialize, Debug, Clone)]
pub struct ImageProcessor {
    #[serde(default = "default_min_pixels")]
    pub min_pixels: u32,
    #[serde(default = "default_max_pixels")]
    pub max_pixels: u32,
    #[serde(default = "default_patch_size")]
    pub patch_size: usize,
    #[serde(default = "default_temporal_patch_size")]
    pub temporal_patch_size: usize,
    #[serde(default = "default_merge_size")]
    pub merge_size: usize,
    #[serde(default = "default_true")]
    pub do_resize: bool,
    //resample: 3 for PIL bicubic, CatmullRom here
    #[serde(default = "default_true")]
    pub do_rescale: bool,
    #[serde(default = "default_rescale_factor")]
    pub rescale_factor: f32,
    #[serde(default = "default_true")]
    pub do_normalize: bool,
    #[serde(default = "default_image_mean")]
    pub image_mean: Vec<f32>,
    #[serde(default = "default_image_std")]
    pub image_std: Vec<f32>,
}

fn default_min_pixels() -> u32 {
    56 * 56
}

fn default_max_pixels() -> u32 {
    16384 * 28 * 28
}

fn default_patch_size() -> usize {
    14
}

fn default_temporal_patch_size() -> usize {
    2
}

fn default_merge_size() -> usize {
    2
}

fn default_true() -> bool {
    true
}

fn default_rescale_factor() -> f32 {
    1.0 / 255.0
}

fn default_image_mean() -> Vec<f32> {
    vec![0.48145466, 0.4578275, 0.40821073]
}

fn default_image_std() -> Vec<f32> {
    vec![0.26862954, 0.26130258, 0.27577711]
}

impl Default for ImageProcessor {
    fn default() -> Self {
        Self {
            min_pixels: default_min_pixels(),
            max_pixels: default_max_pixels(),
            patch_size: default_patch_size(),
            temporal_patch_size: default_temporal_patch_size(),
            merge_size: default_merge_size(),
            do_resize: true,
            do_rescale: true,
            rescale_factor: default_rescale_factor(),
            do_normalize: true,
            image_mean: default_image_mean(),
            image_std: default_image_std(),
        }
    }
}

impl ImageProcessor {
    pub fn from_file(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn factor(&self) -> u32 {
        (self.patch_size * self.merge_size) as u32
    }

    pub fn resize(&self, image: &DynamicImage) -> anyhow::Result<DynamicImage> {
        let (width, height) = image.dimensions();
        let (new_height, new_width) =
            smart_resize(height, width, self.factor(), self.min_pixels, self.max_pixels)?;
        if (new_width, new_height) == (width, height) {
            Ok(image.clone())
        } else {
            Ok(image.resize_exact(
                new_width,
                new_height,
                image::imageops::FilterType::CatmullRom,
            ))
        }
    }

    pub fn to_tensor(&self, image: &DynamicImage) -> candle_core::Result<Tensor> {
        let img = image.to_rgb8().into_raw();
        let (width, height) = image.dimensions();
        Tensor::from_vec(img, (height as usize, width as usize, 3), &Device::Cpu)?
            .to_dtype(DType::F32)
    }

    pub fn rescale(&self, tensor: &Tensor) -> candle_core::Result<Tensor> {
        tensor.affine(self.rescale_factor as f64, 0.0)
    }

    pub fn normalize(&self, tensor: &Tensor) -> candle_core::Result<Tensor> {
        let mean = Tensor::from_vec(self.image_mean.clone(), (3,), &Device::Cpu)?;
        let std = Tensor::from_vec(self.image_std.clone(), (3,), &Device::Cpu)?;
        tensor.broadcast_sub(&mean)?.broadcast_div(&std)
    }

    /// One frame to a `(C, H, W)` tensor.
    fn preprocess_frame(&self, image: &DynamicImage) -> anyhow::Result<Tensor> {
        let image = if self.do_resize {
            self.resize(image)?
        } else {
            image.clone()
        };
        let tensor = self.to_tensor(&image)?;
        let tensor = if self.do_rescale {
            self.rescale(&tensor)?
        } else {
            tensor
        };
        let tensor = if self.do_normalize {
            self.normalize(&tensor)?
        } else {
            tensor
        };
        Ok(tensor.permute((2, 0, 1))?)
    }

    /// Turns the frames of one image or video into `(patches, C * T * P * P)`
    /// with patches of one merge window adjacent, plus the patch grid.
    pub fn preprocess(&self, frames: &[DynamicImage]) -> anyhow::Result<(Tensor, GridThw)> {
        if frames.is_empty() {
            bail!("no frames to preprocess");
        }
        let mut frames = frames
            .iter()
            .map(|frame| self.preprocess_frame(frame))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let (channels, height, width) = frames[0].dims3()?;
        if frames.iter().any(|f| f.dims() != [channels, height, width]) {
            bail!("all frames must share one size");
        }
        while frames.len() % self.temporal_patch_size != 0 {
            frames.push(frames[frames.len() - 1].clone());
        }

        let (ps, tp, m) = (self.patch_size, self.temporal_patch_size, self.merge_size);
        let grid = GridThw::new(frames.len() / tp, height / ps, width / ps);
        let patches = Tensor::stack(&frames, 0)?
            .reshape(vec![
                grid.t,
                tp,
                channels,
                grid.h / m,
                m,
                ps,
                grid.w / m,
                m,
                ps,
            ])?
            .permute(vec![0, 3, 6, 4, 7, 2, 1, 5, 8])?
            .reshape((grid.num_patches(), channels * tp * ps * ps))?;
        Ok((patches, grid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smart_resize_keeps_multiples_of_28() {
        assert_eq!(smart_resize(280, 420, 28, 3136, 12845056).unwrap(), (280, 420));
        assert_eq!(smart_resize(300, 500, 28, 3136, 12845056).unwrap(), (308, 504));
        // 1.5 rounds to the even neighbour
        assert_eq!(smart_resize(42, 42, 28, 3136, 12845056).unwrap(), (56, 56));
    }

    #[test]
    fn smart_resize_respects_pixel_budget() {
        let (h, w) = smart_resize(4000, 6000, 28, 3136, 28 * 28 * 1280).unwrap();
        assert!(h * w <= 28 * 28 * 1280);
        assert_eq!((h % 28, w % 28), (0, 0));

        let (h, w) = smart_resize(28, 28, 28, 56 * 56, 12845056).unwrap();
        assert!(h * w >= 56 * 56);
    }

    #[test]
    fn smart_resize_rejects_tiny_and_extreme_images() {
        assert!(smart_resize(10, 400, 28, 3136, 12845056).is_err());
        assert!(smart_resize(28, 28 * 201, 28, 3136, 12845056).is_err());
    }

    #[test]
    fn image_becomes_two_frame_patches() {
        let processor = ImageProcessor::default();
        let image = DynamicImage::new_rgb8(420, 280);
        let (patches, grid) = processor.preprocess(&[image]).unwrap();
        assert_eq!(grid, GridThw::new(1, 20, 30));
        assert_eq!(patches.dims(), &[600, 3 * 2 * 14 * 14]);
        assert_eq!(grid.num_merged_tokens(2), 150);
    }

    #[test]
    fn odd_frame_counts_are_padded() {
        let processor = ImageProcessor::default();
        let frames = vec![DynamicImage::new_rgb8(56, 56); 3];
        let (patches, grid) = processor.preprocess(&frames).unwrap();
        assert_eq!(grid, GridThw::new(2, 4, 4));
        assert_eq!(patches.dim(0).unwrap(), 32);
    }

    #[test]
    fn black_pixels_normalize_to_minus_mean_over_std() {
        let processor = ImageProcessor::default();
        let (patches, _) = processor.preprocess(&[DynamicImage::new_rgb8(28, 28)]).unwrap();
        let first = patches.get(0).unwrap().get(0).unwrap().to_scalar::<f32>().unwrap();
        let expected = -0.48145466 / 0.26862954;
        assert!((first - expected).abs() < 1e-5);
    }
}
