//! Compiled artifact directories.
//!
//! A directory pins the tensor-parallel degree, bucket set, precision,
//! batch size, model and accelerator configuration it was compiled for;
//! [`Manifest::ensure_compatible`] refuses to hand it to a handle set up
//! differently.

pub mod manifest;
pub mod store;

pub use manifest::{Manifest, FORMAT_VERSION};
pub use store::{graph_file_name, CompiledArtifacts, AUTOTUNE_FILE, MANIFEST_FILE};
