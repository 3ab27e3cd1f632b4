use candle_core::{quantized::GgmlDType, DType};
use serde::{Deserialize, Serialize};

/// Weight precision requested when a model is loaded.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[strum(ascii_case_insensitive)]
pub enum QuantizationMode {
    #[default]
    #[strum(to_string = "none", serialize = "off", serialize = "native")]
    None,
    #[strum(to_string = "int8", serialize = "8", serialize = "8bit")]
    Int8,
    #[strum(to_string = "int4", serialize = "4", serialize = "4bit")]
    Int4,
}

impl QuantizationMode {
    /// `8` and `4` select a quantized load; any other bit count means native precision.
    pub fn from_bits(bits: u32) -> Self {
        match bits {
            8 => QuantizationMode::Int8,
            4 => QuantizationMode::Int4,
            _ => QuantizationMode::None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantType {
    #[default]
    Fp4,
    Nf4,
}

/// Quantization settings handed to the weight loader.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuantizationConfig {
    pub load_in_8bit: bool,
    pub load_in_4bit: bool,
    pub compute_dtype: Option<DType>,
    pub double_quant: bool,
    pub quant_type: QuantType,
}

impl QuantizationConfig {
    /// Block format used for the quantized linear layers.
    pub fn weight_dtype(&self) -> GgmlDType {
        if self.load_in_4bit {
            if self.double_quant {
                // k-quants also quantize the per-block scales
                GgmlDType::Q4K
            } else {
                GgmlDType::Q4_0
            }
        } else {
            GgmlDType::Q8_0
        }
    }
}

pub fn resolve_quantization(mode: QuantizationMode) -> Option<QuantizationConfig> {
    match mode {
        QuantizationMode::Int8 => Some(QuantizationConfig {
            load_in_8bit: true,
            ..Default::default()
        }),
        QuantizationMode::Int4 => Some(QuantizationConfig {
            load_in_4bit: true,
            compute_dtype: Some(DType::F16),
            double_quant: true,
            quant_type: QuantType::Nf4,
            ..Default::default()
        }),
        QuantizationMode::None => None,
    }
}
