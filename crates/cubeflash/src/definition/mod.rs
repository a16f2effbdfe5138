mod error;
mod problem;
mod tiling;

pub use error::*;
pub use problem::*;
pub use tiling::*;
