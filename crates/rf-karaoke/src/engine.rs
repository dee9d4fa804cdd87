//! SeparationEngine: flow training objective and chunked separation
//!
//! The flow models the residual `target - mixed` conditioned on the mix.
//! Training maximizes its likelihood under a Gaussian latent prior;
//! separation draws latent noise, inverts the flow chunk by chunk, adds the
//! mix back and clips to `[-1, 1]`.

use std::fs;
use std::path::Path;

use ndarray::{Array2, ArrayView2, Axis, s};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use rf_flow::{ChunkedInferenceController, FlowOutput, FlowStack, ParameterMap};

use crate::config::SeparationConfig;
use crate::context::{MetricsSink, RunMode, TrainingContext};
use crate::data::{SongWindow, stack_windows};
use crate::error::{SeparationError, SeparationResult};

/// Terms of the negative log-likelihood for one batch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossBreakdown {
    /// Normalized loss `(-(conv + coupling) + prior) / elements`
    pub total: f64,
    /// Summed channel-mix log-determinant
    pub conv_log_det: f64,
    /// Summed coupling log-scale
    pub coupling_log_det: f64,
    /// `Σ z² / (2σ²)`
    pub prior: f64,
    /// `batch · samples`
    pub elements: usize,
}

impl LossBreakdown {
    fn new(output: &FlowOutput, train_std: f32) -> Self {
        let elements = output.latent.len();
        let sigma = train_std as f64;
        let sum_sq = output
            .latent
            .iter()
            .map(|&z| (z as f64) * (z as f64))
            .sum::<f64>();
        let prior = sum_sq / (2.0 * sigma * sigma);
        let nll = -(output.conv_log_det + output.coupling_log_det) + prior;

        Self {
            total: if elements == 0 { 0.0 } else { nll / elements as f64 },
            conv_log_det: output.conv_log_det,
            coupling_log_det: output.coupling_log_det,
            prior,
            elements,
        }
    }
}

/// Output of one separation call
#[derive(Debug, Clone, PartialEq)]
pub struct Separated {
    /// Predicted `target - mixed`
    pub residual: Vec<f32>,
    /// Accompaniment estimate, `clip(mixed + residual, -1, 1)`
    pub target: Vec<f32>,
}

/// Flow-based separation engine
#[derive(Debug, Clone)]
pub struct SeparationEngine {
    config: SeparationConfig,
    stack: FlowStack,
    controller: ChunkedInferenceController,
    noise_rng: ChaCha8Rng,
}

impl SeparationEngine {
    /// Build an engine, seeded from `config.seed` or OS entropy
    pub fn new(config: SeparationConfig) -> SeparationResult<Self> {
        let mut rng = match config.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_os_rng(),
        };
        Self::with_rng(config, &mut rng)
    }

    /// Build an engine drawing parameters and the noise seed from `rng`
    pub fn with_rng<R: Rng + ?Sized>(
        config: SeparationConfig,
        rng: &mut R,
    ) -> SeparationResult<Self> {
        config.validate()?;

        let stack = FlowStack::new(config.flow.clone(), rng)?;
        let controller = ChunkedInferenceController::for_stack(&stack, config.chunking.clone())?;
        let noise_rng = ChaCha8Rng::seed_from_u64(rng.random());

        log::info!(
            "Separation engine: {} flow steps, group size {}, {} parameters, receptive field {} frames",
            config.flow.num_flows,
            config.flow.group_size,
            stack.num_parameters(),
            stack.receptive_field()
        );

        Ok(Self {
            config,
            stack,
            controller,
            noise_rng,
        })
    }

    pub fn config(&self) -> &SeparationConfig {
        &self.config
    }

    pub fn stack(&self) -> &FlowStack {
        &self.stack
    }

    pub fn controller(&self) -> &ChunkedInferenceController {
        &self.controller
    }

    /// Mixed signal and residual `target - mixed`, ready for the flow.
    ///
    /// Training demands lengths that already divide by the group size;
    /// evaluation zero-pads both signals instead.
    pub fn preprocess(
        &self,
        mode: RunMode,
        mixed: ArrayView2<f32>,
        target: ArrayView2<f32>,
    ) -> SeparationResult<(Array2<f32>, Array2<f32>)> {
        if mixed.dim() != target.dim() {
            return Err(SeparationError::shape(
                format!("target shaped like mix {:?}", mixed.dim()),
                format!("{:?}", target.dim()),
            ));
        }

        let group = self.config.group_size();
        let (batch, samples) = mixed.dim();
        let remainder = samples % group;

        let (mixed, target) = match mode {
            RunMode::Train if remainder != 0 => {
                return Err(SeparationError::shape(
                    format!("training length divisible by {group}"),
                    format!("{samples} samples"),
                ));
            }
            RunMode::Train => (mixed.to_owned(), target.to_owned()),
            RunMode::Eval => {
                let padded = samples + (group - remainder) % group;
                let mut m = Array2::zeros((batch, padded));
                let mut t = Array2::zeros((batch, padded));
                m.slice_mut(s![.., ..samples]).assign(&mixed);
                t.slice_mut(s![.., ..samples]).assign(&target);
                (m, t)
            }
        };

        let residual = &target - &mixed;
        Ok((mixed, residual))
    }

    /// Negative log-likelihood of a (mixed, target) batch
    pub fn evaluate(
        &self,
        mode: RunMode,
        mixed: ArrayView2<f32>,
        target: ArrayView2<f32>,
    ) -> SeparationResult<LossBreakdown> {
        let (mixed, residual) = self.preprocess(mode, mixed, target)?;
        let output = self.stack.forward(mixed.view(), residual.view())?;
        Ok(LossBreakdown::new(&output, self.config.prior.train_std))
    }

    /// Loss for one batch, with metrics recorded into `ctx`.
    ///
    /// Records `loss_train/*` in training mode and, when `debug` is set, the
    /// per-layer `reverse/*` reconstruction errors. Advances the step counter.
    pub fn train_step<S: MetricsSink>(
        &self,
        ctx: &mut TrainingContext<S>,
        mixed: ArrayView2<f32>,
        target: ArrayView2<f32>,
    ) -> SeparationResult<f64> {
        let (mixed, residual) = self.preprocess(ctx.mode(), mixed, target)?;
        let output = self.stack.forward(mixed.view(), residual.view())?;
        let loss = LossBreakdown::new(&output, self.config.prior.train_std);

        if ctx.is_training() {
            ctx.record("loss_train/conv", -loss.conv_log_det);
            ctx.record("loss_train/coupling", -loss.coupling_log_det);
            ctx.record("loss_train/prior", loss.prior);
            ctx.record("loss_train/total", loss.total);

            if self.config.debug {
                let report = self
                    .stack
                    .verify_reconstruction(mixed.view(), residual.view())?;
                for layer in &report.layers {
                    ctx.record(&layer.tag(), layer.max_abs_error as f64);
                }
                ctx.record("reverse/all", report.end_to_end as f64);
            }
        }

        log::trace!("step {}: loss {:.6}", ctx.step(), loss.total);
        ctx.advance();
        Ok(loss.total)
    }

    /// `train_step` over stacked dataset windows
    pub fn train_batch<S: MetricsSink>(
        &self,
        ctx: &mut TrainingContext<S>,
        windows: &[SongWindow],
    ) -> SeparationResult<f64> {
        let (mixed, target) = stack_windows(windows)?;
        self.train_step(ctx, mixed.view(), target.view())
    }

    /// Separate a mono signal with the engine's own noise stream
    pub fn separate(&mut self, mixed: &[f32]) -> SeparationResult<Separated> {
        let mut rng = self.noise_rng.clone();
        let separated = self.separate_with_rng(mixed, &mut rng);
        self.noise_rng = rng;
        separated
    }

    /// Separate a mono signal drawing latent noise from `rng`
    pub fn separate_with_rng<R: Rng + ?Sized>(
        &self,
        mixed: &[f32],
        rng: &mut R,
    ) -> SeparationResult<Separated> {
        if mixed.is_empty() {
            return Ok(Separated {
                residual: Vec::new(),
                target: Vec::new(),
            });
        }

        let eval_std = self.config.prior.eval_std;
        let normal = Normal::new(0.0f32, eval_std)
            .map_err(|e| SeparationError::InvalidConfig(format!("inference prior: {e}")))?;

        let conditioning = ArrayView2::from_shape((1, mixed.len()), mixed)
            .map_err(|e| SeparationError::shape("mono signal", e.to_string()))?;
        let noise = Array2::from_shape_fn((1, mixed.len()), |_| normal.sample(&mut *rng));

        let residual = self
            .controller
            .generate(&self.stack, conditioning, noise.view())?;
        let residual: Vec<f32> = residual.index_axis(Axis(0), 0).to_vec();

        let target = mixed
            .iter()
            .zip(&residual)
            .map(|(m, r)| (m + r).clamp(-1.0, 1.0))
            .collect();

        Ok(Separated { residual, target })
    }

    /// Separate interleaved multichannel audio channel by channel.
    /// Returns the interleaved target.
    pub fn separate_interleaved(
        &mut self,
        audio: &[f32],
        channels: usize,
    ) -> SeparationResult<Vec<f32>> {
        if channels == 0 || audio.len() % channels != 0 {
            return Err(SeparationError::shape(
                format!("whole frames of {channels} channels"),
                format!("{} samples", audio.len()),
            ));
        }

        let mut output = vec![0.0f32; audio.len()];
        for ch in 0..channels {
            let mono: Vec<f32> = audio.iter().skip(ch).step_by(channels).copied().collect();
            let separated = self.separate(&mono)?;
            for (frame, value) in separated.target.into_iter().enumerate() {
                output[frame * channels + ch] = value;
            }
        }

        Ok(output)
    }

    /// Snapshot of every learned tensor
    pub fn parameters(&self) -> ParameterMap {
        self.stack.parameters()
    }

    /// Replace every learned tensor (all-or-nothing)
    pub fn load_parameters(&mut self, params: &ParameterMap) -> SeparationResult<()> {
        self.stack.load_parameters(params)?;
        Ok(())
    }

    /// Write parameters as JSON
    pub fn save_weights(&self, path: impl AsRef<Path>) -> SeparationResult<()> {
        let path = path.as_ref();
        let params = self.parameters();
        fs::write(path, serde_json::to_vec(&params)?)?;
        log::info!(
            "Saved {} tensors ({} values) to {}",
            params.len(),
            params.num_elements(),
            path.display()
        );
        Ok(())
    }

    /// Read parameters written by `save_weights`
    pub fn load_weights(&mut self, path: impl AsRef<Path>) -> SeparationResult<()> {
        let path = path.as_ref();
        let params: ParameterMap = serde_json::from_slice(&fs::read(path)?)?;
        self.load_parameters(&params)?;
        log::info!("Loaded {} tensors from {}", params.len(), path.display());
        Ok(())
    }
}
