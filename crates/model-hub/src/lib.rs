mod cache;
mod repo;

pub use cache::*;
pub use repo::*;
