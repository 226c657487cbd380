//! Kernel primitives for sharded decoder execution.

pub mod attention;
pub mod config;
pub mod matmul;
pub mod norm;
pub mod registry;
pub mod utils;

pub use attention::*;
pub use config::*;
pub use matmul::*;
pub use norm::*;
pub use registry::*;
pub use utils::*;
