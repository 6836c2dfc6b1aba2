//! Low-level, stateless byte kernels shared by the codebook store and codecs.

pub mod zstd;
