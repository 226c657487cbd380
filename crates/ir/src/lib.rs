//! Per-bucket decoder graphs, tensor-parallel layout and lowering.

pub mod builder;
pub mod dialect;
pub mod lowering;
pub mod passes;
pub mod sharding;

pub use builder::*;
pub use dialect::*;
pub use lowering::*;
pub use passes::*;
pub use sharding::*;
