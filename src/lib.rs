//! Quantized grouped convolution (QLinearConv) for u8 activations and u8/i8
//! filters, with arbitrary kernel rank, channel-first or channel-last layout,
//! a depthwise fast path and one-time filter packing.
//!
//! The math primitives sit behind [`backend::QuantBackend`]; tiles of output
//! positions fan out over a caller-owned `rayon` pool.

pub mod backend;
pub mod error;
pub mod kernels;
pub mod tensor;

pub use backend::{CpuBackend, QuantBackend};
pub use error::{QConvError, Result};
pub use kernels::{
    ConvAttributes, ExecutionStrategy, FilterSource, PreparedFilter, QLinearConv, QLinearConvInputs,
};
pub use tensor::{TensorView, WeightTensor};
