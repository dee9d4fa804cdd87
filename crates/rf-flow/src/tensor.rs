//! Channel grouping and tensor helpers
//!
//! Flat signals `(batch, samples)` enter the flow as `(batch, G, L)` with
//! `L = samples / G`. The reshape is row-major: sub-channel `g` carries the
//! contiguous samples `g * L .. (g + 1) * L`.

use ndarray::{Array2, Array3, ArrayView2, ArrayView3, ArrayViewD, Axis, Zip, concatenate};

use crate::error::{FlowError, FlowResult};

/// Reshape a flat batch into channel groups
pub fn group_channels(signal: ArrayView2<f32>, group_size: usize) -> FlowResult<Array3<f32>> {
    let (batch, samples) = signal.dim();
    if group_size == 0 || samples % group_size != 0 {
        return Err(FlowError::shape(
            format!("sample count divisible by {group_size}"),
            format!("{samples} samples"),
        ));
    }

    signal
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order((batch, group_size, samples / group_size))
        .map_err(|e| FlowError::shape("contiguous (batch, samples)", e.to_string()))
}

/// Flatten `(batch, channels, L)` back into `(batch, channels * L)`
pub fn flatten_channels(state: Array3<f32>) -> FlowResult<Array2<f32>> {
    let (batch, channels, len) = state.dim();
    state
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order((batch, channels * len))
        .map_err(|e| FlowError::shape("contiguous (batch, channels, L)", e.to_string()))
}

/// Concatenate along the channel axis
pub fn concat_channels(parts: &[ArrayView3<f32>]) -> FlowResult<Array3<f32>> {
    concatenate(Axis(1), parts).map_err(|e| FlowError::shape("matching (batch, L)", e.to_string()))
}

/// Require `(batch, channels, L)` with a fixed channel count
pub(crate) fn expect_channels(state: &ArrayView3<f32>, channels: usize) -> FlowResult<()> {
    let got = state.len_of(Axis(1));
    if got != channels {
        return Err(FlowError::shape(
            format!("{channels} channels"),
            format!("{got} channels"),
        ));
    }
    Ok(())
}

/// Largest absolute element-wise difference (0 for empty tensors)
pub fn max_abs_diff(a: ArrayViewD<f32>, b: ArrayViewD<f32>) -> f32 {
    if a.shape() != b.shape() {
        return f32::INFINITY;
    }
    Zip::from(&a)
        .and(&b)
        .fold(0.0f32, |acc, x, y| acc.max((x - y).abs()))
}
