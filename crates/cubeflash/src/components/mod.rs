mod block_info;
mod dropout;
mod mask;
mod paged;
mod rotary;
mod softmax;

pub use block_info::*;
pub use dropout::*;
pub use mask::*;
pub use paged::*;
pub use rotary::*;
pub use softmax::*;
