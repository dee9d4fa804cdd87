//! Affine coupling layer
//!
//! Channels split into halves `(a, b)`. A dilated residual network reads
//! `a + proj(conditioning)` and predicts `(log_s, t)` for the other half:
//!
//! ```text
//! forward:  b' = exp(log_s) * b + t        log|J| = Σ log_s
//! inverse:  b  = (b' - t) / exp(log_s)
//! ```
//!
//! `a` passes through untouched, so the inverse recomputes the exact same
//! `(log_s, t)` from it; no activations are cached between directions.
//! `log_s` is not clamped: a diverging network shows up as non-finite output.

use ndarray::{Array3, ArrayView3, Axis, s};
use rand::Rng;

use crate::config::SubnetConfig;
use crate::conv::{Conv1d, relu};
use crate::error::{FlowError, FlowResult};
use crate::tensor::{concat_channels, expect_channels};

/// `x + pointwise(relu(dilated(x)))`
#[derive(Debug, Clone)]
pub struct ResidualBlock {
    pub(crate) dilated: Conv1d,
    pub(crate) pointwise: Conv1d,
}

impl ResidualBlock {
    pub fn new<R: Rng + ?Sized>(
        width: usize,
        kernel_size: usize,
        dilation: usize,
        rng: &mut R,
    ) -> FlowResult<Self> {
        Ok(Self {
            dilated: Conv1d::new(width, width, kernel_size, dilation, true, rng)?,
            pointwise: Conv1d::pointwise(width, width, true, rng)?,
        })
    }

    pub fn forward(&self, x: ArrayView3<f32>) -> FlowResult<Array3<f32>> {
        let hidden = relu(self.dilated.forward(x)?);
        let mut out = self.pointwise.forward(hidden.view())?;
        out += &x;
        Ok(out)
    }

    pub fn dilation(&self) -> usize {
        self.dilated.dilation()
    }
}

/// Predicts `(log_s, t)` stacked along channels
#[derive(Debug, Clone)]
pub struct CouplingNet {
    pub(crate) start: Conv1d,
    pub(crate) blocks: Vec<ResidualBlock>,
    pub(crate) end: Conv1d,
}

impl CouplingNet {
    pub fn new<R: Rng + ?Sized>(
        half: usize,
        channels: usize,
        config: &SubnetConfig,
        rng: &mut R,
    ) -> FlowResult<Self> {
        config.validate()?;
        let dilations = config.dilation.dilations(config.depth)?;

        let start = Conv1d::pointwise(half, config.width, false, rng)?;
        let blocks = dilations
            .into_iter()
            .map(|d| ResidualBlock::new(config.width, config.kernel_size, d, rng))
            .collect::<FlowResult<Vec<_>>>()?;
        // zero output layer: the coupling starts as the identity
        let end = Conv1d::zeros(config.width, channels, true)?;

        Ok(Self { start, blocks, end })
    }

    pub fn forward(&self, x: ArrayView3<f32>) -> FlowResult<Array3<f32>> {
        let mut h = self.start.forward(x)?;
        for block in &self.blocks {
            h = block.forward(h.view())?;
        }
        self.end.forward(h.view())
    }

    /// Receptive field in frames
    pub fn receptive_field(&self) -> usize {
        1 + self
            .blocks
            .iter()
            .map(|b| 2 * b.dilated.radius())
            .sum::<usize>()
    }
}

/// Conditional affine coupling over `channels` (even) flow channels
#[derive(Debug, Clone)]
pub struct AffineCoupling {
    channels: usize,
    pub(crate) cond_proj: Conv1d,
    pub(crate) net: CouplingNet,
}

impl AffineCoupling {
    /// Build a coupling layer; `cond_channels` is the group size `G`
    pub fn new<R: Rng + ?Sized>(
        channels: usize,
        cond_channels: usize,
        config: &SubnetConfig,
        rng: &mut R,
    ) -> FlowResult<Self> {
        if channels == 0 || channels % 2 != 0 {
            return Err(FlowError::Configuration(format!(
                "affine coupling needs an even channel count, got {channels}"
            )));
        }
        let half = channels / 2;
        Ok(Self {
            channels,
            cond_proj: Conv1d::pointwise(cond_channels, half, false, rng)?,
            net: CouplingNet::new(half, channels, config, rng)?,
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn net(&self) -> &CouplingNet {
        &self.net
    }

    fn scale_and_shift(
        &self,
        conditioning: ArrayView3<f32>,
        a: ArrayView3<f32>,
    ) -> FlowResult<(Array3<f32>, Array3<f32>)> {
        let mut input = self.cond_proj.forward(conditioning)?;
        if input.dim() != a.dim() {
            return Err(FlowError::shape(
                format!("conditioning aligned with {:?}", a.dim()),
                format!("{:?}", input.dim()),
            ));
        }
        input += &a;

        let out = self.net.forward(input.view())?;
        let half = self.channels / 2;
        let log_s = out.slice(s![.., ..half, ..]).to_owned();
        let t = out.slice(s![.., half.., ..]).to_owned();
        Ok((log_s, t))
    }

    /// Forward transform; returns the output and `Σ log_s` (the log-Jacobian).
    /// The matching loss term is its negation.
    pub fn forward(
        &self,
        conditioning: ArrayView3<f32>,
        x: ArrayView3<f32>,
    ) -> FlowResult<(Array3<f32>, f64)> {
        expect_channels(&x, self.channels)?;
        let (a, b) = x.split_at(Axis(1), self.channels / 2);
        let (log_s, t) = self.scale_and_shift(conditioning, a)?;

        let b_out = log_s.mapv(f32::exp) * &b + &t;
        let log_det = log_s.iter().map(|&v| v as f64).sum::<f64>();

        Ok((concat_channels(&[a.view(), b_out.view()])?, log_det))
    }

    /// Inverse transform
    pub fn inverse(
        &self,
        conditioning: ArrayView3<f32>,
        y: ArrayView3<f32>,
    ) -> FlowResult<Array3<f32>> {
        expect_channels(&y, self.channels)?;
        let (a, b_out) = y.split_at(Axis(1), self.channels / 2);
        let (log_s, t) = self.scale_and_shift(conditioning, a)?;

        let b = (&b_out - &t) / log_s.mapv(f32::exp);

        concat_channels(&[a.view(), b.view()])
    }
}
