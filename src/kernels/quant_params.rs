use crate::error::{QConvError, Result};
use crate::tensor::{TensorView, WeightTensor};

/// Resolved zero points and scales for one call.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantParams {
    pub x_zero_point: u8,
    /// 0 when the operator has no `Y_zero_point` input.
    pub y_zero_point: u8,
    pub x_scale: f32,
    pub y_scale: Option<f32>,
    /// Widened filter zero point, shared across the whole reduction dimension.
    pub w_zero_point: i32,
    /// `X_scale * W_scale[i] (/ Y_scale)`; one entry, or one per output channel.
    pub output_scales: Vec<f32>,
}

impl QuantParams {
    pub fn per_channel(&self) -> bool {
        self.output_scales.len() > 1
    }
}

pub struct QuantInputs<'i, 'a> {
    pub x_scale: &'i TensorView<'a, f32>,
    pub x_zero_point: &'i TensorView<'a, u8>,
    pub w_scale: &'i TensorView<'a, f32>,
    pub w_zero_point: &'i WeightTensor<'a>,
    pub y_scale: Option<&'i TensorView<'a, f32>>,
    pub y_zero_point: Option<&'i TensorView<'a, u8>>,
}

pub fn resolve_quant_params(
    inputs: &QuantInputs<'_, '_>,
    output_channels: usize,
    w_is_signed: bool,
) -> Result<QuantParams> {
    let (x_zero_point, y_zero_point, w_zero_point) =
        check_zero_points(inputs, output_channels, w_is_signed)?;
    let (x_scale, y_scale, output_scales) = check_scales(inputs, output_channels)?;
    Ok(QuantParams {
        x_zero_point,
        y_zero_point,
        x_scale,
        y_scale,
        w_zero_point,
        output_scales,
    })
}

/// Filter scale/zero-point: rank 0, or rank 1 of length 1 or M.
fn is_valid_filter_param_shape(shape: &[usize], output_channels: usize) -> bool {
    match shape.len() {
        0 => true,
        1 => shape[0] == 1 || shape[0] == output_channels,
        _ => false,
    }
}

fn check_zero_points(
    inputs: &QuantInputs<'_, '_>,
    output_channels: usize,
    w_is_signed: bool,
) -> Result<(u8, u8, i32)> {
    if !inputs.x_zero_point.is_scalar_or_single() {
        return Err(QConvError::InvalidArgument(
            "QLinearConv : input zero point must be a scalar or 1D tensor of size 1".into(),
        ));
    }
    let x_zero_point = inputs.x_zero_point.data[0];

    let y_zero_point = match inputs.y_zero_point {
        Some(y_zp) => {
            if !y_zp.is_scalar_or_single() {
                return Err(QConvError::InvalidArgument(
                    "QLinearConv : result zero point must be a scalar or 1D tensor of size 1".into(),
                ));
            }
            y_zp.data[0]
        }
        None => 0,
    };

    let w_zp = inputs.w_zero_point;
    if w_zp.is_signed() != w_is_signed {
        return Err(QConvError::Unsupported(
            "QLinearConv : filter zero point element type must match the filter element type".into(),
        ));
    }
    if !is_valid_filter_param_shape(w_zp.shape(), output_channels) || w_zp.is_empty() {
        return Err(QConvError::InvalidArgument(
            "QLinearConv : filter zero point shape invalid".into(),
        ));
    }
    let w_zero_point = w_zp.value(0);
    if (1..w_zp.len()).any(|i| w_zp.value(i) != w_zero_point) {
        return Err(QConvError::InvalidArgument(
            "QLinearConv : filter zero point must be constant".into(),
        ));
    }

    Ok((x_zero_point, y_zero_point, w_zero_point))
}

fn check_scales(
    inputs: &QuantInputs<'_, '_>,
    output_channels: usize,
) -> Result<(f32, Option<f32>, Vec<f32>)> {
    if !inputs.x_scale.is_scalar_or_single() {
        return Err(QConvError::InvalidArgument(
            "QLinearConv : input scale must be a scalar or 1D tensor of size 1".into(),
        ));
    }
    let x_scale = inputs.x_scale.data[0];

    let y_scale = match inputs.y_scale {
        Some(ys) => {
            if !ys.is_scalar_or_single() {
                return Err(QConvError::InvalidArgument(
                    "QLinearConv : result scale must be a scalar or 1D tensor of size 1".into(),
                ));
            }
            Some(ys.data[0])
        }
        None => None,
    };

    let w_scale = inputs.w_scale;
    if !is_valid_filter_param_shape(&w_scale.shape, output_channels) || w_scale.is_empty() {
        return Err(QConvError::InvalidArgument(
            "QLinearConv : filter scale shape invalid".into(),
        ));
    }
    let output_scales = w_scale
        .data
        .iter()
        .map(|&ws| match y_scale {
            Some(ys) => x_scale * ws / ys,
            None => x_scale * ws,
        })
        .collect();

    Ok((x_scale, y_scale, output_scales))
}
