use candle_core::{Device, Tensor};

/// Patch grid of one image or video: frames, rows and columns of patches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridThw {
    pub t: usize,
    pub h: usize,
    pub w: usize,
}

impl GridThw {
    pub fn new(t: usize, h: usize, w: usize) -> Self {
        Self { t, h, w }
    }

    pub fn num_patches(&self) -> usize {
        self.t * self.h * self.w
    }

    /// Number of placeholder tokens the language model sees after the
    /// vision tower merges `merge_size x merge_size` patch windows.
    pub fn num_merged_tokens(&self, merge_size: usize) -> usize {
        self.num_patches() / (merge_size * merge_size)
    }
}

/// One padded, tokenized batch as produced by a processor.
#[derive(Debug, Clone)]
pub struct BatchInputs {
    /// `(batch, seq)` u32
    pub input_ids: Tensor,
    /// `(batch, seq)` u32, 1 for real tokens and 0 for padding
    pub attention_mask: Tensor,
    /// `(image patches, C * T * P * P)`, all images of the batch in prompt order
    pub pixel_values: Option<Tensor>,
    pub image_grid_thw: Vec<GridThw>,
    /// `(video patches, C * T * P * P)`, all videos of the batch in prompt order
    pub pixel_values_videos: Option<Tensor>,
    pub video_grid_thw: Vec<GridThw>,
}

impl BatchInputs {
    pub fn batch_size(&self) -> anyhow::Result<usize> {
        Ok(self.input_ids.dim(0)?)
    }

    pub fn input_rows(&self) -> anyhow::Result<Vec<Vec<u32>>> {
        Ok(self.input_ids.to_vec2::<u32>()?)
    }

    pub fn mask_rows(&self) -> anyhow::Result<Vec<Vec<u32>>> {
        Ok(self.attention_mask.to_vec2::<u32>()?)
    }

    pub fn to_device(self, device: &Device) -> anyhow::Result<Self> {
        let move_opt = |t: Option<Tensor>| -> anyhow::Result<Option<Tensor>> {
            Ok(match t {
                Some(t) => Some(t.to_device(device)?),
                None => None,
            })
        };

        Ok(Self {
            input_ids: self.input_ids.to_device(device)?,
            attention_mask: self.attention_mask.to_device(device)?,
            pixel_values: move_opt(self.pixel_values)?,
            image_grid_thw: self.image_grid_thw,
            pixel_values_videos: move_opt(self.pixel_values_videos)?,
            video_grid_thw: self.video_grid_thw,
        })
    }
}
