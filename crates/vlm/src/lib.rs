#[cfg(feature = "accelerate")]
extern crate accelerate_src;

mod device;
mod loader;
mod message;
mod quantization;
mod settings;
mod traits;

pub mod qwen2_vl;

pub use device::*;
pub use loader::*;
pub use message::*;
pub use quantization::*;
pub use settings::*;
pub use traits::*;

pub use image;
pub use tokenizers;
