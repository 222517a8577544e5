//! Helpers shared by the de-identification pipeline and the line-oriented file formats.

pub mod kv;
pub mod permutation;
