mod adapter;
mod generation;
mod inputs;
mod processor;

pub use adapter::*;
pub use generation::*;
pub use inputs::*;
pub use processor::*;
