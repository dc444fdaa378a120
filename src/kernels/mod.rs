pub mod conv_attrs;
pub mod im2col;
pub mod partition;
pub mod qlinear_conv;
pub mod quant_params;
pub mod requantize;
pub mod utils;
pub mod weights;

pub use conv_attrs::{infer_output_dim, ConvAttributes, ConvGeometry};
pub use partition::{is_hybrid_cpu, max_thread_count, partition_work};
pub use qlinear_conv::{ExecutionStrategy, QLinearConv, QLinearConvInputs};
pub use quant_params::{resolve_quant_params, QuantInputs, QuantParams};
pub use requantize::requantize_output;
pub use weights::{prepare_filter, reorder_filter, FilterLayout, FilterSource, GemmFilter, PreparedFilter};
