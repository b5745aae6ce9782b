//! Content-addressed artifact cache for Stratum.
//!
//! Artifacts live under `<root>/cas/<key>/`. New artifacts are assembled
//! in a private staging directory under `<root>/tmp/` and published with
//! a single rename, so a reader either sees a complete artifact or none.

pub mod local;
mod tree;

pub use local::{LocalCache, StagedArtifact};
pub use stratum_core::artifact::{ArtifactRef, ArtifactStore, CacheError, CacheKey};
