//! 1-D convolution over `(batch, channels, L)` tensors
//!
//! Every convolution in the flow keeps the sequence length ("same" zero
//! padding, odd kernels only). Each kernel tap is evaluated as one matrix
//! product `W_tap · X_shifted`, so the work goes through ndarray's GEMM.

use ndarray::{Array1, Array3, ArrayView3, Axis, s};
use rand::Rng;

use crate::error::{FlowError, FlowResult};

/// Dilated 1-D convolution with optional bias
#[derive(Debug, Clone)]
pub struct Conv1d {
    /// Weights `(out_channels, in_channels, kernel_size)`
    weight: Array3<f32>,
    /// Per-output-channel bias
    bias: Option<Array1<f32>>,
    /// Spacing between kernel taps
    dilation: usize,
}

impl Conv1d {
    /// Uniform `±1/sqrt(fan_in)` initialization (weights and bias)
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        dilation: usize,
        bias: bool,
        rng: &mut R,
    ) -> FlowResult<Self> {
        Self::check_geometry(in_channels, out_channels, kernel_size, dilation)?;

        let bound = 1.0 / ((in_channels * kernel_size) as f32).sqrt();
        let weight = Array3::from_shape_fn((out_channels, in_channels, kernel_size), |_| {
            rng.random_range(-bound..bound)
        });
        let bias =
            bias.then(|| Array1::from_shape_fn(out_channels, |_| rng.random_range(-bound..bound)));

        Ok(Self {
            weight,
            bias,
            dilation,
        })
    }

    /// Pointwise (1x1) convolution
    pub fn pointwise<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        bias: bool,
        rng: &mut R,
    ) -> FlowResult<Self> {
        Self::new(in_channels, out_channels, 1, 1, bias, rng)
    }

    /// All-zero convolution; emits exactly zero for any finite input
    pub fn zeros(in_channels: usize, out_channels: usize, bias: bool) -> FlowResult<Self> {
        Self::check_geometry(in_channels, out_channels, 1, 1)?;
        Ok(Self {
            weight: Array3::zeros((out_channels, in_channels, 1)),
            bias: bias.then(|| Array1::zeros(out_channels)),
            dilation: 1,
        })
    }

    fn check_geometry(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        dilation: usize,
    ) -> FlowResult<()> {
        if in_channels == 0 || out_channels == 0 {
            return Err(FlowError::Configuration(format!(
                "convolution needs non-empty channels, got {in_channels} -> {out_channels}"
            )));
        }
        if kernel_size % 2 == 0 {
            return Err(FlowError::Configuration(format!(
                "kernel size must be odd for length-preserving padding, got {kernel_size}"
            )));
        }
        if dilation == 0 {
            return Err(FlowError::Configuration("dilation must be at least 1".into()));
        }
        Ok(())
    }

    pub fn in_channels(&self) -> usize {
        self.weight.len_of(Axis(1))
    }

    pub fn out_channels(&self) -> usize {
        self.weight.len_of(Axis(0))
    }

    pub fn kernel_size(&self) -> usize {
        self.weight.len_of(Axis(2))
    }

    pub fn dilation(&self) -> usize {
        self.dilation
    }

    /// Frames of context consumed on each side of an output position
    pub fn radius(&self) -> usize {
        (self.kernel_size() - 1) / 2 * self.dilation
    }

    pub fn weight(&self) -> &Array3<f32> {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Array1<f32>> {
        self.bias.as_ref()
    }

    /// Replace weights, keeping the layer geometry
    pub fn set_weight(&mut self, weight: Array3<f32>) -> FlowResult<()> {
        if weight.dim() != self.weight.dim() {
            return Err(FlowError::shape(
                format!("{:?}", self.weight.dim()),
                format!("{:?}", weight.dim()),
            ));
        }
        self.weight = weight;
        Ok(())
    }

    /// Replace the bias vector
    pub fn set_bias(&mut self, bias: Array1<f32>) -> FlowResult<()> {
        match &self.bias {
            Some(current) if current.len() == bias.len() => {
                self.bias = Some(bias);
                Ok(())
            }
            Some(current) => Err(FlowError::shape(
                format!("bias of {}", current.len()),
                format!("bias of {}", bias.len()),
            )),
            None => Err(FlowError::Configuration(
                "convolution was built without bias".into(),
            )),
        }
    }

    /// Apply the convolution; output keeps batch and length
    pub fn forward(&self, x: ArrayView3<f32>) -> FlowResult<Array3<f32>> {
        let (batch, in_channels, len) = x.dim();
        if in_channels != self.in_channels() {
            return Err(FlowError::shape(
                format!("{} input channels", self.in_channels()),
                format!("{in_channels} input channels"),
            ));
        }

        let kernel = self.kernel_size();
        let center = (kernel - 1) / 2;
        let mut y = Array3::<f32>::zeros((batch, self.out_channels(), len));

        for (xb, mut yb) in x.outer_iter().zip(y.outer_iter_mut()) {
            for tap in 0..kernel {
                let offset = (tap as isize - center as isize) * self.dilation as isize;
                let shift = offset.unsigned_abs();
                if shift >= len {
                    continue;
                }

                // output t reads input t + offset
                let (dst, src) = if offset >= 0 {
                    (0..len - shift, shift..len)
                } else {
                    (shift..len, 0..len - shift)
                };

                let w = self.weight.index_axis(Axis(2), tap);
                let contrib = w.dot(&xb.slice(s![.., src]));
                let mut out = yb.slice_mut(s![.., dst]);
                out += &contrib;
            }

            if let Some(bias) = &self.bias {
                yb += &bias.view().insert_axis(Axis(1));
            }
        }

        Ok(y)
    }
}

/// Element-wise rectifier
pub fn relu(mut x: Array3<f32>) -> Array3<f32> {
    x.mapv_inplace(|v| v.max(0.0));
    x
}
