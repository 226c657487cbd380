//! Model loading, compilation, sampling and persistence for tensor-parallel
//! decoder models.

#[cfg(feature = "cli")]
pub mod cli;
pub mod eval;
pub mod metrics;
pub mod pipeline;
pub mod session;

#[cfg(feature = "cli")]
pub use cli::*;
pub use eval::*;
pub use metrics::*;
pub use pipeline::*;
pub use session::*;
