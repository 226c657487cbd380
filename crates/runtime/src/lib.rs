//! Simulated accelerator mesh: one logical core per tensor-parallel rank.

pub mod collectives;
pub mod executor;
pub mod mesh;
pub mod placement;

pub use executor::{Executor, StepReport};
pub use mesh::{Core, CoreMemory, Mesh};
pub use placement::{place, CoreState, PlacementRequest};
