use super::config::Config;
use crate::GridThw;
use anyhow::bail;
use candle_core::{DType, Device, Result, Tensor};

fn inv_freq(dim: usize, theta: f64, device: &Device) -> Result<Tensor> {
    let inv_freq: Vec<f32> = (0..dim)
        .step_by(2)
        .map(|i| 1f32 / (theta as f32).powf(i as f32 / dim as f32))
        .collect();
    let len = inv_freq.len();
    Tensor::from_vec(inv_freq, (1, len), device)
}

fn outer(positions: &[u32], inv_freq: &Tensor) -> Result<Tensor> {
    let positions: Vec<f32> = positions.iter().map(|&p| p as f32).collect();
    let len = positions.len();
    Tensor::from_vec(positions, (len, 1), inv_freq.device())?.matmul(inv_freq)
}

/// Rotary embedding of the decoder: the rotary half-dims are split into
/// temporal, height and width sections, each rotated by its own position axis.
#[derive(Debug, Clone)]
pub struct MultimodalRotaryEmbedding {
    inv_freq: Tensor,
    mrope_section: Vec<usize>,
}

impl MultimodalRotaryEmbedding {
    pub fn new(config: &Config, device: &Device) -> Result<Self> {
        let head_dim = config.head_dim();
        let mrope_section = config.rope_scaling.mrope_section.clone();
        let section_sum: usize = mrope_section.iter().sum();
        if mrope_section.len() != 3 || section_sum != head_dim / 2 {
            candle_core::bail!(
                "mrope_section {:?} must have 3 entries summing to {}",
                mrope_section,
                head_dim / 2
            );
        }
        Ok(Self {
            inv_freq: inv_freq(head_dim, config.rope_theta, device)?,
            mrope_section,
        })
    }

    /// `positions` holds the temporal, height and width position of every token.
    /// Returns `(cos, sin)`, each `(seq, head_dim / 2)`.
    pub fn cos_sin(&self, positions: &[Vec<u32>; 3], dtype: DType) -> Result<(Tensor, Tensor)> {
        let mut sections = Vec::with_capacity(3);
        let mut offset = 0;
        for (axis, &len) in self.mrope_section.iter().enumerate() {
            let freqs = outer(&positions[axis], &self.inv_freq)?;
            sections.push(freqs.narrow(1, offset, len)?);
            offset += len;
        }
        let freqs = Tensor::cat(&sections, 1)?.contiguous()?;
        Ok((freqs.cos()?.to_dtype(dtype)?, freqs.sin()?.to_dtype(dtype)?))
    }
}

/// 2D rotary embedding of the vision tower: half of the rotary dims follow
/// the patch row, the other half the patch column.
#[derive(Debug, Clone)]
pub struct VisionRotaryEmbedding {
    inv_freq: Tensor,
}

impl VisionRotaryEmbedding {
    const THETA: f64 = 10000.0;

    pub fn new(head_dim: usize, device: &Device) -> Result<Self> {
        Ok(Self {
            inv_freq: inv_freq(head_dim / 2, Self::THETA, device)?,
        })
    }

    /// `(cos, sin)` for every patch of `grids`, each `(patches, head_dim / 2)`,
    /// in the same merge-window order the processor flattens patches in.
    pub fn cos_sin(
        &self,
        grids: &[GridThw],
        merge_size: usize,
        dtype: DType,
    ) -> Result<(Tensor, Tensor)> {
        let mut h_positions = vec![];
        let mut w_positions = vec![];
        for grid in grids {
            for _ in 0..grid.t {
                for hb in 0..grid.h / merge_size {
                    for wb in 0..grid.w / merge_size {
                        for i in 0..merge_size {
                            for j in 0..merge_size {
                                h_positions.push((hb * merge_size + i) as u32);
                                w_positions.push((wb * merge_size + j) as u32);
                            }
                        }
                    }
                }
            }
        }
        let freqs_h = outer(&h_positions, &self.inv_freq)?;
        let freqs_w = outer(&w_positions, &self.inv_freq)?;
        let freqs = Tensor::cat(&[freqs_h, freqs_w], 1)?.contiguous()?;
        Ok((freqs.cos()?.to_dtype(dtype)?, freqs.sin()?.to_dtype(dtype)?))
    }
}

/// 3-axis positions of one unpadded prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RopeIndex {
    pub positions: [Vec<u32>; 3],
    /// Added to the cache length to get the position of each generated token.
    pub delta: i64,
}

impl RopeIndex {
    pub fn position_after(&self, cache_len: usize) -> u32 {
        (cache_len as i64 + self.delta) as u32
    }
}

/// Text tokens advance all three axes together. A run of vision placeholders
/// is laid out on its merged `(t, h, w)` grid starting at the current
/// position, and text after it resumes past the largest grid side.
pub fn get_rope_index<'i, 'v>(
    input_ids: &[u32],
    config: &Config,
    image_grids: &mut impl Iterator<Item = &'i GridThw>,
    video_grids: &mut impl Iterator<Item = &'v GridThw>,
) -> anyhow::Result<RopeIndex> {
    let merge = config.vision_config.spatial_merge_size;
    let mut positions: [Vec<u32>; 3] = Default::default();
    let mut next = 0u32;
    let mut i = 0;

    while i < input_ids.len() {
        let token = input_ids[i];
        let grid: Option<&GridThw> = if token == config.image_token_id {
            image_grids.next()
        } else if token == config.video_token_id {
            video_grids.next()
        } else {
            for axis in positions.iter_mut() {
                axis.push(next);
            }
            next += 1;
            i += 1;
            continue;
        };

        let Some(grid) = grid else {
            bail!("vision placeholder at position {} has no matching grid", i);
        };
        let (t, h, w) = (grid.t, grid.h / merge, grid.w / merge);
        if i + t * h * w > input_ids.len()
            || input_ids[i..i + t * h * w].iter().any(|&id| id != token)
        {
            bail!(
                "expected {} placeholder tokens at position {}, grid {:?}",
                t * h * w,
                i,
                grid
            );
        }
        for ti in 0..t {
            for hi in 0..h {
                for wi in 0..w {
                    positions[0].push(next + ti as u32);
                    positions[1].push(next + hi as u32);
                    positions[2].push(next + wi as u32);
                }
            }
        }
        next += t.max(h).max(w) as u32;
        i += t * h * w;
    }

    Ok(RopeIndex {
        positions,
        delta: next as i64 - input_ids.len() as i64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qwen2_vl::model::config::tests::tiny_config;

    #[test]
    fn text_only_positions_are_sequential() {
        let config = tiny_config();
        let index =
            get_rope_index(&[1, 2, 3, 4], &config, &mut [].iter(), &mut [].iter()).unwrap();
        for axis in &index.positions {
            assert_eq!(axis, &vec![0, 1, 2, 3]);
        }
        assert_eq!(index.delta, 0);
        assert_eq!(index.position_after(4), 4);
    }

    #[test]
    fn image_tokens_use_merged_grid_positions() {
        let config = tiny_config();
        let img = config.image_token_id;
        // grid (1, 4, 6) merges to 1 x 2 x 3 = 6 tokens
        let ids = [1, 58, img, img, img, img, img, img, 2, 3];
        let grids = [GridThw::new(1, 4, 6)];
        let index = get_rope_index(&ids, &config, &mut grids.iter(), &mut [].iter()).unwrap();

        assert_eq!(index.positions[0], vec![0, 1, 2, 2, 2, 2, 2, 2, 5, 6]);
        assert_eq!(index.positions[1], vec![0, 1, 2, 2, 2, 3, 3, 3, 5, 6]);
        assert_eq!(index.positions[2], vec![0, 1, 2, 3, 4, 2, 3, 4, 5, 6]);
        // 7 positions for 10 tokens
        assert_eq!(index.delta, -3);
        assert_eq!(index.position_after(10), 7);
    }

    #[test]
    fn missing_grid_is_an_error() {
        let config = tiny_config();
        let img = config.image_token_id;
        assert!(get_rope_index(&[img], &config, &mut [].iter(), &mut [].iter()).is_err());

        let grids = [GridThw::new(1, 4, 4)];
        assert!(get_rope_index(&[img, img], &config, &mut grids.iter(), &mut [].iter()).is_err());
    }

    #[test]
    fn mrope_matches_plain_rope_for_text() {
        let config = tiny_config();
        let device = Device::Cpu;
        let rope = MultimodalRotaryEmbedding::new(&config, &device).unwrap();
        let positions = [vec![0, 1, 2], vec![0, 1, 2], vec![0, 1, 2]];
        let (cos, _) = rope.cos_sin(&positions, DType::F32).unwrap();
        assert_eq!(cos.dims(), &[3, config.head_dim() / 2]);

        let expected = outer(&[0, 1, 2], &inv_freq(config.head_dim(), config.rope_theta, &device).unwrap())
            .unwrap()
            .cos()
            .unwrap();
        let diff = (cos - expected)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(diff < 1e-6);
    }

    #[test]
    fn vision_rope_covers_every_patch() {
        let rope = VisionRotaryEmbedding::new(8, &Device::Cpu).unwrap();
        let grids = [GridThw::new(1, 2, 4), GridThw::new(2, 2, 2)];
        let (cos, sin) = rope.cos_sin(&grids, 2, DType::F32).unwrap();
        assert_eq!(cos.dims(), &[16, 4]);
        assert_eq!(sin.dims(), &[16, 4]);
    }
}
