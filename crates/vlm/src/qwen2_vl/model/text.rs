use super::{config::Config, linear::QLinear, rope::MultimodalRotaryEmbedding};
use crate::QuantizationConfig;
use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{embedding, rms_norm, Embedding, RmsNorm, VarBuilder};
use candle_transformers::utils::repeat_kv;

#[derive(Debug, Clone)]
struct Attention {
    q_proj: QLinear,
    k_proj: QLinear,
    v_proj: QLinear,
    o_proj: QLinear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    kv_cache: Option<(Tensor, Tensor)>,
}

impl Attention {
    fn new(cfg: &Config, quantization: Option<&QuantizationConfig>, vb: VarBuilder) -> Result<Self> {
        let head_dim = cfg.head_dim();
        let (h, nh, nkv) = (cfg.hidden_size, cfg.num_attention_heads, cfg.num_key_value_heads);
        Ok(Self {
            q_proj: QLinear::load(h, nh * head_dim, true, quantization, vb.pp("q_proj"))?,
            k_proj: QLinear::load(h, nkv * head_dim, true, quantization, vb.pp("k_proj"))?,
            v_proj: QLinear::load(h, nkv * head_dim, true, quantization, vb.pp("v_proj"))?,
            o_proj: QLinear::load(nh * head_dim, h, false, quantization, vb.pp("o_proj"))?,
            num_heads: nh,
            num_kv_heads: nkv,
            head_dim,
            kv_cache: None,
        })
    }

    fn forward(
        &mut self,
        xs: &Tensor,
        mask: Option<&Tensor>,
        cos: &Tensor,
        sin: &Tensor,
    ) -> Result<Tensor> {
        let (b, seq_len, _) = xs.dims3()?;

        let q = self
            .q_proj
            .forward(xs)?
            .reshape((b, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = self
            .k_proj
            .forward(xs)?
            .reshape((b, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = self
            .v_proj
            .forward(xs)?
            .reshape((b, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;

        let q = candle_nn::rotary_emb::rope(&q, cos, sin)?;
        let k = candle_nn::rotary_emb::rope(&k, cos, sin)?;

        let (k, v) = match &self.kv_cache {
            None => (k, v),
            Some((prev_k, prev_v)) => (
                Tensor::cat(&[prev_k, &k], 2)?,
                Tensor::cat(&[prev_v, &v], 2)?,
            ),
        };
        self.kv_cache = Some((k.clone(), v.clone()));

        let n_rep = self.num_heads / self.num_kv_heads;
        let k = repeat_kv(k, n_rep)?.contiguous()?;
        let v = repeat_kv(v, n_rep)?.contiguous()?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let attn = (q.matmul(&k.t()?)? * scale)?;
        let attn = match mask {
            Some(mask) => attn.broadcast_add(mask)?,
            None => attn,
        };
        let attn = candle_nn::ops::softmax_last_dim(&attn)?;
        let out = attn
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, seq_len, self.num_heads * self.head_dim))?;
        self.o_proj.forward(&out)
    }

    fn cache_len(&self) -> usize {
        self.kv_cache
            .as_ref()
            .and_then(|(k, _)| k.dim(2).ok())
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
struct Mlp {
    gate_proj: QLinear,
    up_proj: QLinear,
    down_proj: QLinear,
}

impl Mlp {
    fn new(cfg: &Config, quantization: Option<&QuantizationConfig>, vb: VarBuilder) -> Result<Self> {
        let (h, i) = (cfg.hidden_size, cfg.intermediate_size);
        Ok(Self {
            gate_proj: QLinear::load(h, i, false, quantization, vb.pp("gate_proj"))?,
            up_proj: QLinear::load(h, i, false, quantization, vb.pp("up_proj"))?,
            down_proj: QLinear::load(i, h, false, quantization, vb.pp("down_proj"))?,
        })
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(xs)?)?;
        self.down_proj.forward(&(gate * self.up_proj.forward(xs)?)?)
    }
}

#[derive(Debug, Clone)]
struct DecoderLayer {
    self_attn: Attention,
    mlp: Mlp,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl DecoderLayer {
    fn new(cfg: &Config, quantization: Option<&QuantizationConfig>, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            self_attn: Attention::new(cfg, quantization, vb.pp("self_attn"))?,
            mlp: Mlp::new(cfg, quantization, vb.pp("mlp"))?,
            input_layernorm: rms_norm(cfg.hidden_size, cfg.rms_norm_eps, vb.pp("input_layernorm"))?,
            post_attention_layernorm: rms_norm(
                cfg.hidden_size,
                cfg.rms_norm_eps,
                vb.pp("post_attention_layernorm"),
            )?,
        })
    }

    fn forward(
        &mut self,
        xs: &Tensor,
        mask: Option<&Tensor>,
        cos: &Tensor,
        sin: &Tensor,
    ) -> Result<Tensor> {
        let residual = xs;
        let xs = self
            .self_attn
            .forward(&self.input_layernorm.forward(xs)?, mask, cos, sin)?;
        let xs = (xs + residual)?;
        let residual = &xs;
        let ys = self.mlp.forward(&self.post_attention_layernorm.forward(&xs)?)?;
        residual + ys
    }
}

/// Qwen2 decoder with 3-axis rotary positions. Runs one unpadded row at a time.
#[derive(Debug, Clone)]
pub struct TextModel {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    rotary: MultimodalRotaryEmbedding,
    dtype: DType,
    device: Device,
}

impl TextModel {
    /// `vb` points at the checkpoint root; only `model.*` is read.
    pub fn new(cfg: &Config, quantization: Option<&QuantizationConfig>, vb: VarBuilder) -> Result<Self> {
        let vb_m = vb.pp("model");
        let embed_tokens = embedding(cfg.vocab_size, cfg.hidden_size, vb_m.pp("embed_tokens"))?;
        let layers = (0..cfg.num_hidden_layers)
            .map(|i| DecoderLayer::new(cfg, quantization, vb_m.pp("layers").pp(i)))
            .collect::<Result<Vec<_>>>()?;
        let norm = rms_norm(cfg.hidden_size, cfg.rms_norm_eps, vb_m.pp("norm"))?;

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            rotary: MultimodalRotaryEmbedding::new(cfg, vb.device())?,
            dtype: vb.dtype(),
            device: vb.device().clone(),
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// `(seq,)` ids to `(seq, hidden)` embeddings.
    pub fn embed(&self, input_ids: &Tensor) -> Result<Tensor> {
        self.embed_tokens.forward(input_ids)
    }

    /// Number of positions already held in the key/value cache.
    pub fn cache_len(&self) -> usize {
        self.layers
            .first()
            .map(|l| l.self_attn.cache_len())
            .unwrap_or(0)
    }

    /// Runs `(1, seq, hidden)` embeddings placed at `positions` after whatever
    /// is cached, returning the normed hidden states.
    pub fn forward_embeds(&mut self, embeds: &Tensor, positions: &[Vec<u32>; 3]) -> Result<Tensor> {
        let (_, seq_len, _) = embeds.dims3()?;
        let (cos, sin) = self.rotary.cos_sin(positions, self.dtype)?;
        let mask = if seq_len > 1 {
            Some(causal_mask(seq_len, self.cache_len(), self.dtype, &self.device)?)
        } else {
            None
        };

        let mut xs = embeds.to_dtype(self.dtype)?;
        for layer in self.layers.iter_mut() {
            xs = layer.forward(&xs, mask.as_ref(), &cos, &sin)?;
        }
        self.norm.forward(&xs)
    }

    /// `(vocab, hidden)` token embedding matrix, shared with a tied LM head.
    pub fn embeddings(&self) -> &Tensor {
        self.embed_tokens.embeddings()
    }

    pub fn clear_kv_cache(&mut self) {
        for layer in self.layers.iter_mut() {
            layer.self_attn.kv_cache = None;
        }
    }
}

fn causal_mask(seq_len: usize, offset: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| {
            (0..seq_len + offset).map(move |j| {
                if j > i + offset {
                    f32::NEG_INFINITY
                } else {
                    0.
                }
            })
        })
        .collect();
    Tensor::from_vec(mask, (seq_len, seq_len + offset), device)?
        .to_dtype(dtype)?
        .reshape((1, 1, seq_len, seq_len + offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qwen2_vl::model::config::tests::tiny_config;

    fn sequential(n: u32, from: u32) -> [Vec<u32>; 3] {
        let p: Vec<u32> = (from..from + n).collect();
        [p.clone(), p.clone(), p]
    }

    #[test]
    fn kv_cache_grows_and_clears() {
        let cfg = tiny_config();
        let mut model = TextModel::new(&cfg, None, VarBuilder::zeros(DType::F32, &Device::Cpu)).unwrap();

        let ids = Tensor::new(&[1u32, 2, 3], &Device::Cpu).unwrap();
        let embeds = model.embed(&ids).unwrap().unsqueeze(0).unwrap();
        let hidden = model.forward_embeds(&embeds, &sequential(3, 0)).unwrap();
        assert_eq!(hidden.dims(), &[1, 3, cfg.hidden_size]);
        assert_eq!(model.cache_len(), 3);

        let next = model.embed(&Tensor::new(&[4u32], &Device::Cpu).unwrap()).unwrap();
        let hidden = model
            .forward_embeds(&next.unsqueeze(0).unwrap(), &sequential(1, 3))
            .unwrap();
        assert_eq!(hidden.dims(), &[1, 1, cfg.hidden_size]);
        assert_eq!(model.embeddings().dims(), &[cfg.vocab_size, cfg.hidden_size]);
        assert_eq!(model.cache_len(), 4);

        model.clear_kv_cache();
        assert_eq!(model.cache_len(), 0);
    }

    #[test]
    fn mask_hides_future_positions_only() {
        let mask = causal_mask(2, 1, DType::F32, &Device::Cpu)
            .unwrap()
            .squeeze(0)
            .unwrap()
            .squeeze(0)
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        assert_eq!(mask[0], vec![0., 0., f32::NEG_INFINITY]);
        assert_eq!(mask[1], vec![0., 0., 0.]);
    }
}
