//! Autotuning of matmul kernels for the local shapes of a sharded graph.

pub mod cache;
pub mod tuner;

pub use cache::*;
pub use tuner::*;
