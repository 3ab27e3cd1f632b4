use crate::BatchInputs;
use anyhow::bail;
use candle_core::{DType, Device};
use std::str::FromStr;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DevicePreference {
    #[default]
    Auto,
    Cpu,
    Cuda(usize),
    Metal,
}

impl FromStr for DevicePreference {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "" | "auto" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda(0)),
            "metal" | "mps" => Ok(DevicePreference::Metal),
            _ => match s.strip_prefix("cuda:") {
                Some(ordinal) => Ok(DevicePreference::Cuda(ordinal.parse()?)),
                None => bail!("unsupported device: {}", s),
            },
        }
    }
}

/// Resolves a preference into a concrete candle device.
///
/// `Auto` tries CUDA, then Metal, then falls back to the CPU.
pub fn select_device(preference: DevicePreference) -> anyhow::Result<Device> {
    let device = match preference {
        DevicePreference::Cpu => Device::Cpu,
        DevicePreference::Cuda(ordinal) => Device::new_cuda(ordinal)?,
        DevicePreference::Metal => Device::new_metal(0)?,
        DevicePreference::Auto => {
            if candle_core::utils::cuda_is_available() {
                Device::new_cuda(0)?
            } else if candle_core::utils::metal_is_available() {
                Device::new_metal(0)?
            } else {
                Device::Cpu
            }
        }
    };
    debug!("selected device: {:?}", device);
    Ok(device)
}

/// Precision used when a model is loaded without quantization.
pub fn native_dtype(device: &Device) -> DType {
    match device {
        Device::Cuda(_) => DType::BF16,
        Device::Metal(_) => DType::F16,
        Device::Cpu => DType::F32,
    }
}

/// Where batches run, and how to release memory held there.
pub trait Accelerator {
    /// Returns cached allocator memory to the device. Failures are only logged.
    fn empty_cache(&self);

    fn move_batch(&self, inputs: BatchInputs) -> anyhow::Result<BatchInputs>;
}

impl Accelerator for Device {
    fn empty_cache(&self) {
        // candle frees buffers on drop; waiting for queued kernels is all there is to flush
        if let Err(e) = self.synchronize() {
            warn!("failed to synchronize {:?}: {}", self, e);
        }
    }

    fn move_batch(&self, inputs: BatchInputs) -> anyhow::Result<BatchInputs> {
        inputs.to_device(self)
    }
}
