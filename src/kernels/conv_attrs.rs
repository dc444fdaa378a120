use crate::error::{QConvError, Result};
use crate::kernels::utils::shape_size;
use serde::{Deserialize, Serialize};

/// Convolution attributes as they appear on the operator node.
/// Empty `pads`/`dilations`/`strides` mean 0/1/1 along every spatial axis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvAttributes {
    pub group: i64,
    pub pads: Vec<i64>,
    pub dilations: Vec<i64>,
    pub strides: Vec<i64>,
    pub kernel_shape: Vec<i64>,
    pub channels_last: bool,
}

impl Default for ConvAttributes {
    fn default() -> Self {
        Self {
            group: 1,
            pads: Vec::new(),
            dilations: Vec::new(),
            strides: Vec::new(),
            kernel_shape: Vec::new(),
            channels_last: false,
        }
    }
}

impl ConvAttributes {
    pub fn new(group: i64) -> Self {
        Self {
            group,
            ..Self::default()
        }
    }
    pub fn with_pads(mut self, pads: &[i64]) -> Self {
        self.pads = pads.to_vec();
        self
    }
    pub fn with_strides(mut self, strides: &[i64]) -> Self {
        self.strides = strides.to_vec();
        self
    }
    pub fn with_dilations(mut self, dilations: &[i64]) -> Self {
        self.dilations = dilations.to_vec();
        self
    }
    pub fn with_kernel_shape(mut self, kernel_shape: &[i64]) -> Self {
        self.kernel_shape = kernel_shape.to_vec();
        self
    }
    pub fn channels_last(mut self, channels_last: bool) -> Self {
        self.channels_last = channels_last;
        self
    }
}

/// Convolution geometry for one call, derived from attributes and the X/W shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvGeometry {
    pub batch: usize,
    pub input_channels: usize,
    pub output_channels: usize,
    pub group: usize,
    pub channels_last: bool,
    pub kernel_rank: usize,
    pub kernel_shape: Vec<usize>,
    pub input_shape: Vec<usize>,
    pub output_shape: Vec<usize>,
    /// `[begin_0, .., begin_{r-1}, end_0, .., end_{r-1}]`
    pub pads: Vec<usize>,
    pub strides: Vec<usize>,
    pub dilations: Vec<usize>,
    pub input_image_size: usize,
    pub output_image_size: usize,
    pub kernel_size: usize,
    pub y_shape: Vec<usize>,
}

impl ConvGeometry {
    pub fn resolve(attrs: &ConvAttributes, x_shape: &[usize], w_shape: &[usize]) -> Result<Self> {
        if w_shape.len() < 2 {
            return Err(QConvError::InvalidShape(format!(
                "QLinearConv : weight must have rank >= 2, got rank {}",
                w_shape.len()
            )));
        }
        if x_shape.len() != w_shape.len() {
            return Err(QConvError::InvalidShape(format!(
                "QLinearConv : input rank {} does not match weight rank {}",
                x_shape.len(),
                w_shape.len()
            )));
        }
        if attrs.group < 1 {
            return Err(QConvError::InvalidShape(format!(
                "QLinearConv : group must be >= 1, got {}",
                attrs.group
            )));
        }

        let kernel_rank = w_shape.len() - 2;
        let kernel_shape = w_shape[2..].to_vec();
        if !attrs.kernel_shape.is_empty() {
            let declared: Vec<i64> = kernel_shape.iter().map(|&k| k as i64).collect();
            if declared != attrs.kernel_shape {
                return Err(QConvError::InvalidShape(format!(
                    "QLinearConv : kernel_shape {:?} does not match weight spatial dims {:?}",
                    attrs.kernel_shape, kernel_shape
                )));
            }
        }
        if kernel_shape.iter().any(|&k| k == 0) {
            return Err(QConvError::InvalidShape(format!(
                "QLinearConv : kernel dims must be positive, got {:?}",
                kernel_shape
            )));
        }

        let pads = expand_attr(&attrs.pads, kernel_rank * 2, 0, 0, "pads")?;
        let strides = expand_attr(&attrs.strides, kernel_rank, 1, 1, "strides")?;
        let dilations = expand_attr(&attrs.dilations, kernel_rank, 1, 1, "dilations")?;

        let channels_last = attrs.channels_last;
        let batch = x_shape[0];
        let output_channels = w_shape[0];
        let group = attrs.group as usize;
        let (input_channels, spatial_start) = if channels_last {
            (x_shape[1 + kernel_rank], 1)
        } else {
            (x_shape[1], 2)
        };
        let input_shape = x_shape[spatial_start..spatial_start + kernel_rank].to_vec();

        if input_channels != w_shape[1] * group {
            return Err(QConvError::InvalidShape(format!(
                "QLinearConv : input channels {} != weight channels {} * group {}",
                input_channels, w_shape[1], group
            )));
        }
        if output_channels % group != 0 {
            return Err(QConvError::InvalidShape(format!(
                "QLinearConv : output channels {} not divisible by group {}",
                output_channels, group
            )));
        }

        let mut output_shape = Vec::with_capacity(kernel_rank);
        for d in 0..kernel_rank {
            output_shape.push(infer_output_dim(
                input_shape[d],
                kernel_shape[d],
                strides[d],
                dilations[d],
                pads[d],
                pads[d + kernel_rank],
            )?);
        }

        let mut y_shape = Vec::with_capacity(kernel_rank + 2);
        y_shape.push(batch);
        if !channels_last {
            y_shape.push(output_channels);
        }
        y_shape.extend_from_slice(&output_shape);
        if channels_last {
            y_shape.push(output_channels);
        }

        Ok(Self {
            batch,
            input_channels,
            output_channels,
            group,
            channels_last,
            kernel_rank,
            input_image_size: shape_size(&input_shape),
            output_image_size: shape_size(&output_shape),
            kernel_size: shape_size(&kernel_shape),
            kernel_shape,
            input_shape,
            output_shape,
            pads,
            strides,
            dilations,
            y_shape,
        })
    }

    pub fn group_input_channels(&self) -> usize {
        self.input_channels / self.group
    }

    pub fn group_output_channels(&self) -> usize {
        self.output_channels / self.group
    }

    pub fn has_strides_one_and_no_padding(&self) -> bool {
        self.strides.iter().all(|&s| s == 1) && self.pads.iter().all(|&p| p == 0)
    }

    /// The input is already the column matrix: 1x..x1 kernel, unit strides, no padding.
    pub fn is_pointwise(&self) -> bool {
        self.kernel_size == 1 && self.has_strides_one_and_no_padding()
    }

    pub fn is_empty_output(&self) -> bool {
        shape_size(&self.y_shape) == 0
    }
}

fn expand_attr(
    values: &[i64],
    len: usize,
    default: usize,
    min: i64,
    name: &str,
) -> Result<Vec<usize>> {
    if values.is_empty() {
        return Ok(vec![default; len]);
    }
    if values.len() != len {
        return Err(QConvError::InvalidShape(format!(
            "QLinearConv : {} has {} values, expected {}",
            name,
            values.len(),
            len
        )));
    }
    values
        .iter()
        .map(|&v| {
            if v < min {
                Err(QConvError::InvalidShape(format!(
                    "QLinearConv : {} value {} must be >= {}",
                    name, v, min
                )))
            } else {
                Ok(v as usize)
            }
        })
        .collect()
}

/// `floor((input + pad_begin + pad_end - dilation * (kernel - 1) - 1) / stride) + 1`.
/// Zero is a valid (empty) extent; a negative one is not.
pub fn infer_output_dim(
    input: usize,
    kernel: usize,
    stride: usize,
    dilation: usize,
    pad_begin: usize,
    pad_end: usize,
) -> Result<usize> {
    let dkernel = (dilation * (kernel - 1) + 1) as i64;
    let numerator = (input + pad_begin + pad_end) as i64 - dkernel;
    let dim = numerator.div_euclid(stride as i64) + 1;
    if dim < 0 {
        return Err(QConvError::InvalidShape(format!(
            "QLinearConv : input extent {} with pads ({}, {}) is too small for dilated kernel {}",
            input, pad_begin, pad_end, dkernel
        )));
    }
    Ok(dim as usize)
}
