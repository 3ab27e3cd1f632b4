use crate::QuantizationConfig;
use candle_core::{
    quantized::{QMatMul, QTensor},
    DType, Module, Tensor,
};
use candle_nn::VarBuilder;

/// Decoder projection, optionally block-quantized at load time.
#[derive(Debug, Clone)]
pub struct QLinear {
    inner: Inner,
    bias: Option<Tensor>,
    span: tracing::Span,
}

#[derive(Debug, Clone)]
enum Inner {
    Dense(Tensor),
    Quantized(QMatMul),
}

impl QLinear {
    pub fn load(
        in_dim: usize,
        out_dim: usize,
        bias: bool,
        quantization: Option<&QuantizationConfig>,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        let weight = vb.get((out_dim, in_dim), "weight")?;
        let bias = if bias {
            Some(vb.get(out_dim, "bias")?)
        } else {
            None
        };

        let inner = match quantization {
            Some(config) if in_dim % config.weight_dtype().block_size() == 0 => {
                let qtensor = QTensor::quantize(&weight.to_dtype(DType::F32)?, config.weight_dtype())?;
                Inner::Quantized(QMatMul::from_qtensor(qtensor)?)
            }
            _ => Inner::Dense(weight),
        };

        let span = tracing::span!(tracing::Level::TRACE, "qlinear");
        Ok(Self { inner, bias, span })
    }

    pub fn is_quantized(&self) -> bool {
        matches!(self.inner, Inner::Quantized(_))
    }
}

impl Module for QLinear {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let _enter = self.span.enter();
        let ys = match &self.inner {
            Inner::Dense(weight) => {
                let w = match *xs.dims() {
                    [b, _, _] => weight.broadcast_left(b)?.t()?,
                    _ => weight.t()?,
                };
                xs.matmul(&w)?
            }
            Inner::Quantized(qmatmul) => {
                // quantized matmul kernels take f32 activations
                let dtype = xs.dtype();
                qmatmul.forward(&xs.to_dtype(DType::F32)?)?.to_dtype(dtype)?
            }
        };
        match &self.bias {
            Some(bias) => ys.broadcast_add(bias),
            None => Ok(ys),
        }
    }
}
