//! FlowStack: ordered (channel mix, affine coupling) steps
//!
//! ```text
//! forward:  x ─┬─ [emit?] ─ mix_0 ─ coupling_0 ─ ... ─ mix_{N-1} ─ coupling_{N-1} ─┐
//!              └─ emitted slices ──────────────────────────────────────────────────┴─ concat ─ z
//! inverse:  z ── split final residual ── coupling⁻¹ / mix⁻¹ from step N-1 down to 0,
//!                re-inserting each emitted slice in front at its step
//! ```
//!
//! Steps run strictly in order (reverse order for the inverse); a step's
//! coupling consumes its own mix output, so any reordering breaks
//! invertibility.

use ndarray::{Array2, Array3, ArrayView2, ArrayView3, Axis, s};
use rand::Rng;

use crate::channel_mix::InvertibleChannelMix;
use crate::config::FlowConfig;
use crate::coupling::AffineCoupling;
use crate::error::{FlowError, FlowResult};
use crate::tensor::{concat_channels, flatten_channels, group_channels};

/// One flow step
#[derive(Debug, Clone)]
pub struct FlowStep {
    pub(crate) mix: InvertibleChannelMix,
    pub(crate) coupling: AffineCoupling,
    emits: bool,
}

impl FlowStep {
    pub fn mix(&self) -> &InvertibleChannelMix {
        &self.mix
    }

    pub fn coupling(&self) -> &AffineCoupling {
        &self.coupling
    }

    /// Whether channels leave the flow before this step
    pub fn emits(&self) -> bool {
        self.emits
    }

    pub fn channels(&self) -> usize {
        self.mix.channels()
    }
}

/// Result of a forward pass
#[derive(Debug, Clone)]
pub struct FlowOutput {
    /// Latent, `(batch, samples)`, same element count as the input
    pub latent: Array2<f32>,
    /// `Σ_steps batch · L · log|det W|`
    pub conv_log_det: f64,
    /// `Σ_steps Σ log_s`
    pub coupling_log_det: f64,
}

impl FlowOutput {
    /// Total log-Jacobian of the pass
    pub fn log_det(&self) -> f64 {
        self.conv_log_det + self.coupling_log_det
    }
}

/// Normalizing flow over channel-grouped signals
#[derive(Debug, Clone)]
pub struct FlowStack {
    config: FlowConfig,
    pub(crate) steps: Vec<FlowStep>,
}

impl FlowStack {
    /// Build a freshly initialized stack
    pub fn new<R: Rng + ?Sized>(config: FlowConfig, rng: &mut R) -> FlowResult<Self> {
        config.validate()?;

        let mut steps = Vec::with_capacity(config.num_flows);
        for i in 0..config.num_flows {
            let channels = config.channels_at(i);
            steps.push(FlowStep {
                mix: InvertibleChannelMix::new(channels, rng)?,
                coupling: AffineCoupling::new(channels, config.group_size, &config.subnet, rng)?,
                emits: config.emits_at(i),
            });
        }

        Ok(Self { config, steps })
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    pub fn steps(&self) -> &[FlowStep] {
        &self.steps
    }

    pub fn group_size(&self) -> usize {
        self.config.group_size
    }

    /// Receptive field of one coupling network, in grouped frames
    pub fn receptive_field(&self) -> usize {
        self.steps
            .iter()
            .map(|s| s.coupling.net().receptive_field())
            .max()
            .unwrap_or(1)
    }

    /// Frames a single output frame depends on, on either side, through
    /// every chained coupling
    pub fn receptive_radius(&self) -> usize {
        self.steps
            .iter()
            .map(|s| s.coupling.net().receptive_field() / 2)
            .sum()
    }

    /// Group conditioning and signal, checking they line up
    pub(crate) fn prepare(
        &self,
        conditioning: ArrayView2<f32>,
        x: ArrayView2<f32>,
    ) -> FlowResult<(Array3<f32>, Array3<f32>)> {
        if conditioning.dim() != x.dim() {
            return Err(FlowError::shape(
                format!("conditioning shaped like input {:?}", x.dim()),
                format!("{:?}", conditioning.dim()),
            ));
        }
        let group = self.config.group_size;
        Ok((group_channels(conditioning, group)?, group_channels(x, group)?))
    }

    /// Split off the slice emitted before a step
    pub(crate) fn emit(&self, state: Array3<f32>) -> (Array3<f32>, Array3<f32>) {
        let e = self.config.emit_channels;
        let emitted = state.slice(s![.., ..e, ..]).to_owned();
        let rest = state.slice(s![.., e.., ..]).to_owned();
        (emitted, rest)
    }

    /// Signal → latent with both log-determinant terms
    pub fn forward(
        &self,
        conditioning: ArrayView2<f32>,
        x: ArrayView2<f32>,
    ) -> FlowResult<FlowOutput> {
        let (cond, mut state) = self.prepare(conditioning, x)?;
        let batch = state.len_of(Axis(0)) as f64;

        let mut outputs = Vec::with_capacity(self.config.emit_steps.len() + 1);
        let mut conv_log_det = 0.0;
        let mut coupling_log_det = 0.0;

        for step in &self.steps {
            if step.emits {
                let (emitted, rest) = self.emit(state);
                outputs.push(emitted);
                state = rest;
            }

            let (mixed, mix_log_det) = step.mix.forward(state.view())?;
            conv_log_det += batch * mix_log_det;

            let (coupled, log_s) = step.coupling.forward(cond.view(), mixed.view())?;
            coupling_log_det += log_s;
            state = coupled;
        }
        outputs.push(state);

        let views: Vec<ArrayView3<f32>> = outputs.iter().map(|o| o.view()).collect();
        let latent = flatten_channels(concat_channels(&views)?)?;

        Ok(FlowOutput {
            latent,
            conv_log_det,
            coupling_log_det,
        })
    }

    /// Latent → signal
    pub fn inverse(
        &self,
        conditioning: ArrayView2<f32>,
        z: ArrayView2<f32>,
    ) -> FlowResult<Array2<f32>> {
        let (cond, latent) = self.prepare(conditioning, z)?;
        let split = self.config.group_size - self.config.final_channels();

        let mut pending = latent.slice(s![.., ..split, ..]).to_owned();
        let mut state = latent.slice(s![.., split.., ..]).to_owned();

        for step in self.steps.iter().rev() {
            let uncoupled = step.coupling.inverse(cond.view(), state.view())?;
            state = step.mix.inverse(uncoupled.view())?;

            if step.emits {
                let held = pending.len_of(Axis(1));
                let cut = held - self.config.emit_channels;
                let restored = concat_channels(&[pending.slice(s![.., cut.., ..]), state.view()])?;
                state = restored;
                pending = pending.slice(s![.., ..cut, ..]).to_owned();
            }
        }

        flatten_channels(state)
    }
}
