#![allow(clippy::too_many_arguments)]
#![allow(clippy::explicit_counter_loop)]

//! Flash-attention forward kernels for CubeCL.
//!
//! The crate computes `O = softmax(Q·K^T · scale + bias + mask) · V` together
//! with the per-row log-sum-exp, streaming K and V through an online-softmax
//! tile loop so the full attention matrix is never materialized.
//!
//! Three kernels cover the forward pass:
//! - a dense kernel, one cube per (query tile, batch, head);
//! - a split-KV kernel that partitions the key sequence across cubes and
//!   additionally handles KV-cache append, rotary embedding and paged KV;
//! - a combine kernel that merges the per-split partial outputs.

/// Half-precision element types the kernels are typically instantiated
/// with; accumulation and softmax state always run in f32.
pub use half::{bf16, f16};

/// Collaborators shared by the kernels: block info, masking, online softmax,
/// dropout RNG, rotary embedding and paged-KV addressing.
pub mod components;
pub mod definition;
/// The forward kernels themselves.
pub mod kernels;
pub mod launch;
