use super::{config::VisionConfig, rope::VisionRotaryEmbedding};
use crate::GridThw;
use candle_core::{Module, Result, Tensor};
use candle_nn::{layer_norm, linear, LayerNorm, Linear, VarBuilder};

fn quick_gelu(xs: &Tensor) -> Result<Tensor> {
    xs.broadcast_mul(&candle_nn::ops::sigmoid(&(xs * 1.702)?)?)
}

/// Conv3d with kernel == stride, applied as a matmul over flattened patches.
#[derive(Debug, Clone)]
struct PatchEmbed {
    proj: Linear,
}

impl PatchEmbed {
    fn new(cfg: &VisionConfig, vb: VarBuilder) -> Result<Self> {
        let weight = vb.pp("proj").get(
            (
                cfg.embed_dim,
                cfg.in_chans,
                cfg.temporal_patch_size,
                cfg.patch_size,
                cfg.patch_size,
            ),
            "weight",
        )?;
        let weight = weight.reshape((cfg.embed_dim, cfg.patch_input_dim()))?;
        Ok(Self {
            proj: Linear::new(weight, None),
        })
    }
}

impl Module for PatchEmbed {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.proj.forward(xs)
    }
}

#[derive(Debug, Clone)]
struct VisionAttention {
    qkv: Linear,
    proj: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl VisionAttention {
    fn new(cfg: &VisionConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            qkv: linear(cfg.embed_dim, 3 * cfg.embed_dim, vb.pp("qkv"))?,
            proj: linear(cfg.embed_dim, cfg.embed_dim, vb.pp("proj"))?,
            num_heads: cfg.num_heads,
            head_dim: cfg.head_dim(),
        })
    }

    /// `xs` is `(patches, embed_dim)`; attention never crosses a segment boundary.
    fn forward(&self, xs: &Tensor, segments: &[usize], cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
        let (seq_len, embed_dim) = xs.dims2()?;
        let qkv = self
            .qkv
            .forward(xs)?
            .reshape((seq_len, 3, self.num_heads, self.head_dim))?
            .permute((1, 2, 0, 3))?;
        // (1, heads, patches, head_dim)
        let q = qkv.get(0)?.unsqueeze(0)?.contiguous()?;
        let k = qkv.get(1)?.unsqueeze(0)?.contiguous()?;
        let v = qkv.get(2)?.unsqueeze(0)?.contiguous()?;
        let q = candle_nn::rotary_emb::rope(&q, cos, sin)?;
        let k = candle_nn::rotary_emb::rope(&k, cos, sin)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let mut outputs = Vec::with_capacity(segments.len());
        let mut start = 0;
        for &len in segments {
            let q = q.narrow(2, start, len)?.contiguous()?;
            let k = k.narrow(2, start, len)?.contiguous()?;
            let v = v.narrow(2, start, len)?.contiguous()?;
            let attn = (q.matmul(&k.t()?)? * scale)?;
            let attn = candle_nn::ops::softmax_last_dim(&attn)?;
            outputs.push(attn.matmul(&v)?);
            start += len;
        }
        let out = Tensor::cat(&outputs, 2)?
            .squeeze(0)?
            .transpose(0, 1)?
            .reshape((seq_len, embed_dim))?;
        self.proj.forward(&out)
    }
}

#[derive(Debug, Clone)]
struct VisionMlp {
    fc1: Linear,
    fc2: Linear,
}

impl VisionMlp {
    fn new(cfg: &VisionConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            fc1: linear(cfg.embed_dim, cfg.mlp_hidden_size(), vb.pp("fc1"))?,
            fc2: linear(cfg.mlp_hidden_size(), cfg.embed_dim, vb.pp("fc2"))?,
        })
    }
}

impl Module for VisionMlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.fc2.forward(&quick_gelu(&self.fc1.forward(xs)?)?)
    }
}

#[derive(Debug, Clone)]
struct VisionBlock {
    norm1: LayerNorm,
    attn: VisionAttention,
    norm2: LayerNorm,
    mlp: VisionMlp,
}

impl VisionBlock {
    fn new(cfg: &VisionConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            norm1: layer_norm(cfg.embed_dim, 1e-6, vb.pp("norm1"))?,
            attn: VisionAttention::new(cfg, vb.pp("attn"))?,
            norm2: layer_norm(cfg.embed_dim, 1e-6, vb.pp("norm2"))?,
            mlp: VisionMlp::new(cfg, vb.pp("mlp"))?,
        })
    }

    fn forward(&self, xs: &Tensor, segments: &[usize], cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
        let residual = xs;
        let xs = self.attn.forward(&self.norm1.forward(xs)?, segments, cos, sin)?;
        let xs = (xs + residual)?;
        let residual = &xs;
        let ys = self.mlp.forward(&self.norm2.forward(&xs)?)?;
        residual + ys
    }
}

/// Projects every `merge x merge` window of patches into one language-model token.
#[derive(Debug, Clone)]
struct PatchMerger {
    ln_q: LayerNorm,
    fc1: Linear,
    fc2: Linear,
    input_dim: usize,
}

impl PatchMerger {
    fn new(cfg: &VisionConfig, vb: VarBuilder) -> Result<Self> {
        let input_dim = cfg.merger_input_dim();
        Ok(Self {
            ln_q: layer_norm(cfg.embed_dim, 1e-6, vb.pp("ln_q"))?,
            fc1: linear(input_dim, input_dim, vb.pp("mlp").pp("0"))?,
            fc2: linear(input_dim, cfg.hidden_size, vb.pp("mlp").pp("2"))?,
            input_dim,
        })
    }
}

impl Module for PatchMerger {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        // patches of one window are already adjacent
        let xs = self.ln_q.forward(xs)?.reshape(((), self.input_dim))?;
        self.fc2.forward(&self.fc1.forward(&xs)?.gelu_erf()?)
    }
}

#[derive(Debug, Clone)]
pub struct VisionTransformer {
    patch_embed: PatchEmbed,
    rotary: VisionRotaryEmbedding,
    blocks: Vec<VisionBlock>,
    merger: PatchMerger,
    spatial_merge_size: usize,
}

impl VisionTransformer {
    pub fn new(cfg: &VisionConfig, vb: VarBuilder) -> Result<Self> {
        let blocks = (0..cfg.depth)
            .map(|i| VisionBlock::new(cfg, vb.pp("blocks").pp(i)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            patch_embed: PatchEmbed::new(cfg, vb.pp("patch_embed"))?,
            rotary: VisionRotaryEmbedding::new(cfg.head_dim(), vb.device())?,
            blocks,
            merger: PatchMerger::new(cfg, vb.pp("merger"))?,
            spatial_merge_size: cfg.spatial_merge_size,
        })
    }

    /// `pixel_values` is `(patches, C * T * P * P)` for all `grids` in order.
    /// Returns `(merged tokens, hidden_size)`.
    pub fn forward(&self, pixel_values: &Tensor, grids: &[GridThw]) -> Result<Tensor> {
        let dtype = self.patch_embed.proj.weight().dtype();
        let mut xs = self.patch_embed.forward(&pixel_values.to_dtype(dtype)?)?;

        let (cos, sin) = self.rotary.cos_sin(grids, self.spatial_merge_size, dtype)?;
        // one attention segment per frame
        let segments: Vec<usize> = grids
            .iter()
            .flat_map(|g| std::iter::repeat(g.h * g.w).take(g.t))
            .collect();
        if segments.iter().sum::<usize>() != xs.dim(0)? {
            candle_core::bail!(
                "pixel values hold {} patches, grids describe {}",
                xs.dim(0)?,
                segments.iter().sum::<usize>()
            );
        }

        for block in &self.blocks {
            xs = block.forward(&xs, &segments, &cos, &sin)?;
        }
        self.merger.forward(&xs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qwen2_vl::model::config::tests::tiny_config;
    use candle_core::{DType, Device};

    #[test]
    fn merges_four_patches_per_token() {
        let cfg = tiny_config().vision_config;
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let vision = VisionTransformer::new(&cfg, vb).unwrap();

        let grids = [GridThw::new(1, 4, 6), GridThw::new(2, 2, 2)];
        let patches: usize = grids.iter().map(|g| g.num_patches()).sum();
        let pixels = Tensor::ones((patches, cfg.patch_input_dim()), DType::F32, &Device::Cpu).unwrap();

        let out = vision.forward(&pixels, &grids).unwrap();
        assert_eq!(out.dims(), &[6 + 2, cfg.hidden_size]);
    }

    #[test]
    fn rejects_pixels_that_do_not_match_grids() {
        let cfg = tiny_config().vision_config;
        let vision = VisionTransformer::new(&cfg, VarBuilder::zeros(DType::F32, &Device::Cpu)).unwrap();
        let pixels = Tensor::ones((8, cfg.patch_input_dim()), DType::F32, &Device::Cpu).unwrap();
        assert!(vision.forward(&pixels, &[GridThw::new(1, 4, 4)]).is_err());
    }
}
