/// Requantize an int32 tile `[rows, cols]` to u8:
/// `clamp(round_ties_even((acc + bias[c]) * scale[c or 0]) + zero_point, 0, 255)`.
///
/// `bias` is broadcast along rows. With `per_column` the scale vector has one
/// entry per column, otherwise `scales[0]` applies everywhere.
pub fn requantize_output(
    acc: &[i32],
    out: &mut [u8],
    bias: Option<&[i32]>,
    rows: usize,
    cols: usize,
    scales: &[f32],
    per_column: bool,
    zero_point: u8,
) {
    debug_assert!(acc.len() >= rows * cols);
    debug_assert!(out.len() >= rows * cols);
    debug_assert!(!per_column || scales.len() >= cols);
    if cols == 0 {
        return;
    }

    let zp = zero_point as f32;
    // Clamp in the float domain before rounding so huge accumulators cannot wrap.
    let min_val = 0.0 - zp;
    let max_val = 255.0 - zp;

    for (acc_row, out_row) in acc[..rows * cols]
        .chunks_exact(cols)
        .zip(out[..rows * cols].chunks_exact_mut(cols))
    {
        for j in 0..cols {
            let mut v = acc_row[j];
            if let Some(b) = bias {
                v = v.wrapping_add(b[j]);
            }
            let scale = if per_column { scales[j] } else { scales[0] };
            let f = (v as f32 * scale).clamp(min_val, max_val);
            out_row[j] = (f.round_ties_even() + zp) as u8;
        }
    }
}
