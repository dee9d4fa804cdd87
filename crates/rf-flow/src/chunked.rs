//! Chunked reverse pass for long signals
//!
//! The inverse flow is run window by window. Each window carries up to
//! `context_margin` extra samples on both sides so the coupling networks see
//! real neighbours at chunk borders; the margins are dropped when stitching.
//!
//! ```text
//!            i - ctx      i          i + chunk    i + chunk + ctx
//!  signal ─────[──context──|────kept────|──context──]─────────
//! ```

use ndarray::{Array2, ArrayView2, Axis, s};
use rayon::prelude::*;

use crate::config::ChunkConfig;
use crate::error::{FlowError, FlowResult};
use crate::stack::FlowStack;

/// One window of the chunk plan, in flat samples
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkWindow {
    /// First sample fed to the inverse
    pub start: usize,
    /// First sample kept in the output
    pub keep_start: usize,
    /// One past the last kept sample
    pub keep_end: usize,
    /// One past the last sample fed to the inverse
    pub end: usize,
}

impl ChunkWindow {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    pub fn kept(&self) -> usize {
        self.keep_end - self.keep_start
    }
}

/// Windowed driver for `FlowStack::inverse`
#[derive(Debug, Clone)]
pub struct ChunkedInferenceController {
    config: ChunkConfig,
    group_size: usize,
}

impl ChunkedInferenceController {
    pub fn new(config: ChunkConfig, group_size: usize) -> FlowResult<Self> {
        config.validate(group_size)?;
        Ok(Self { config, group_size })
    }

    /// Controller sized for `stack`'s channel grouping
    pub fn for_stack(stack: &FlowStack, config: ChunkConfig) -> FlowResult<Self> {
        let controller = Self::new(config, stack.group_size())?;
        if !controller.covers_receptive_radius(stack) {
            let margin = controller.margin_frames();
            let radius = stack.receptive_radius();
            if controller.config == ChunkConfig::default() {
                log::debug!(
                    "Default context margin of {margin} frames, stack radius {radius} frames"
                );
            } else {
                log::warn!(
                    "Context margin of {margin} frames is below the stack receptive radius of {radius} frames"
                );
            }
        }
        Ok(controller)
    }

    /// Context margin in grouped frames
    pub fn margin_frames(&self) -> usize {
        self.config.context_margin / self.group_size
    }

    /// Whether the margin spans every frame the chained couplings can see
    pub fn covers_receptive_radius(&self, stack: &FlowStack) -> bool {
        self.margin_frames() >= stack.receptive_radius()
    }

    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    /// Window plan covering `[0, len)`
    pub fn windows(&self, len: usize) -> Vec<ChunkWindow> {
        let chunk = self.config.chunk_size;
        let ctx = self.config.context_margin;

        (0..len)
            .step_by(chunk.max(1))
            .map(|i| {
                let keep_end = (i + chunk).min(len);
                ChunkWindow {
                    start: i.saturating_sub(ctx),
                    keep_start: i,
                    keep_end,
                    end: (keep_end + ctx).min(len),
                }
            })
            .collect()
    }

    /// Run the inverse over `latent` chunk by chunk.
    ///
    /// Returns exactly as many samples per row as `latent` has; lengths that
    /// do not divide by the group size are zero-padded for the pass and
    /// trimmed afterwards.
    pub fn generate(
        &self,
        stack: &FlowStack,
        conditioning: ArrayView2<f32>,
        latent: ArrayView2<f32>,
    ) -> FlowResult<Array2<f32>> {
        if stack.group_size() != self.group_size {
            return Err(FlowError::Configuration(format!(
                "controller built for group size {}, stack uses {}",
                self.group_size,
                stack.group_size()
            )));
        }
        if conditioning.dim() != latent.dim() {
            return Err(FlowError::shape(
                format!("conditioning shaped like latent {:?}", latent.dim()),
                format!("{:?}", conditioning.dim()),
            ));
        }

        let (batch, len) = latent.dim();
        if len == 0 {
            return Ok(Array2::zeros((batch, 0)));
        }

        let cond = pad_columns(conditioning, self.group_size);
        let z = pad_columns(latent, self.group_size);
        let padded_len = z.len_of(Axis(1));

        let windows = self.windows(padded_len);
        log::debug!(
            "Chunked inverse: {} samples in {} windows (chunk {}, context {})",
            len,
            windows.len(),
            self.config.chunk_size,
            self.config.context_margin
        );

        let run = |w: &ChunkWindow| -> FlowResult<Array2<f32>> {
            let out = stack.inverse(
                cond.slice(s![.., w.start..w.end]),
                z.slice(s![.., w.start..w.end]),
            )?;
            let from = w.keep_start - w.start;
            Ok(out.slice(s![.., from..from + w.kept()]).to_owned())
        };

        let pieces: Vec<Array2<f32>> = if self.config.parallel {
            windows.par_iter().map(run).collect::<FlowResult<_>>()?
        } else {
            windows.iter().map(run).collect::<FlowResult<_>>()?
        };

        let mut output = Array2::zeros((batch, len));
        for (window, piece) in windows.iter().zip(&pieces) {
            if window.keep_start >= len {
                break;
            }
            let keep_end = window.keep_end.min(len);
            let take = keep_end - window.keep_start;
            output
                .slice_mut(s![.., window.keep_start..keep_end])
                .assign(&piece.slice(s![.., ..take]));
        }

        Ok(output)
    }
}

fn pad_columns(signal: ArrayView2<f32>, group_size: usize) -> Array2<f32> {
    let (batch, len) = signal.dim();
    let padded = len.div_ceil(group_size) * group_size;
    let mut out = Array2::zeros((batch, padded));
    out.slice_mut(s![.., ..len]).assign(&signal);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array1;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    use crate::config::{DilationSchedule, FlowConfig, SubnetConfig};
    use crate::tensor::max_abs_diff;

    fn stack(seed: u64) -> FlowStack {
        let config = FlowConfig {
            num_flows: 2,
            group_size: 8,
            emit_steps: vec![],
            emit_channels: 2,
            subnet: SubnetConfig {
                depth: 2,
                width: 8,
                kernel_size: 3,
                dilation: DilationSchedule::Explicit {
                    dilations: vec![1, 2],
                },
            },
        };
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut stack = FlowStack::new(config, &mut rng).unwrap();
        for step in &mut stack.steps {
            let end = &mut step.coupling.net.end;
            let weight = end.weight().mapv(|_| rng.random_range(-0.05..0.05));
            end.set_weight(weight).unwrap();
            let bias = Array1::from_shape_fn(end.out_channels(), |_| rng.random_range(-0.05..0.05));
            end.set_bias(bias).unwrap();
        }
        stack
    }

    fn chunking(chunk_size: usize, context_margin: usize) -> ChunkConfig {
        ChunkConfig {
            chunk_size,
            context_margin,
            parallel: false,
        }
    }

    fn window(start: usize, keep_start: usize, keep_end: usize, end: usize) -> ChunkWindow {
        ChunkWindow {
            start,
            keep_start,
            keep_end,
            end,
        }
    }

    fn signal(len: usize, phase: f32) -> Array2<f32> {
        Array2::from_shape_fn((1, len), |(_, i)| (i as f32 * 0.11 + phase).sin() * 0.4)
    }

    #[test]
    fn test_window_plan() {
        let controller = ChunkedInferenceController::new(chunking(16, 8), 8).unwrap();
        let windows = controller.windows(40);
        assert_eq!(
            windows,
            vec![
                window(0, 0, 16, 24),
                window(8, 16, 32, 40),
                window(24, 32, 40, 40),
            ]
        );
        assert!(windows.iter().all(|w| w.len() % 8 == 0));
        assert_eq!(windows.iter().map(ChunkWindow::kept).sum::<usize>(), 40);
    }

    #[test]
    fn test_single_chunk_matches_direct_inverse() {
        let stack = stack(41);
        let cond = signal(64, 0.0);
        let z = signal(64, 1.3);

        let controller = ChunkedInferenceController::for_stack(&stack, chunking(64, 8)).unwrap();
        let chunked = controller.generate(&stack, cond.view(), z.view()).unwrap();
        let direct = stack.inverse(cond.view(), z.view()).unwrap();
        assert_eq!(chunked, direct);
    }

    #[test]
    fn test_wide_context_matches_direct_inverse() {
        let stack = stack(42);
        let cond = signal(96, 0.5);
        let z = signal(96, 2.1);

        // context larger than the receptive radius of every window
        let controller = ChunkedInferenceController::new(chunking(32, 64), 8).unwrap();
        let chunked = controller.generate(&stack, cond.view(), z.view()).unwrap();
        let direct = stack.inverse(cond.view(), z.view()).unwrap();
        assert!(max_abs_diff(chunked.view().into_dyn(), direct.view().into_dyn()) < 1e-5);
    }

    #[test]
    fn test_margin_against_chained_radius() {
        let stack = stack(47);
        // two couplings of radius 3 frames each
        assert_eq!(stack.receptive_radius(), 6);

        let narrow = ChunkedInferenceController::new(chunking(64, 40), 8).unwrap();
        assert_eq!(narrow.margin_frames(), 5);
        assert!(!narrow.covers_receptive_radius(&stack));

        let wide = ChunkedInferenceController::new(chunking(64, 48), 8).unwrap();
        assert!(wide.covers_receptive_radius(&stack));
    }

    #[test]
    fn test_output_length_is_exact() {
        let stack = stack(43);
        let cond = signal(45, 0.0);
        let z = signal(45, 0.7);

        let controller = ChunkedInferenceController::new(chunking(16, 8), 8).unwrap();
        let out = controller.generate(&stack, cond.view(), z.view()).unwrap();
        assert_eq!(out.dim(), (1, 45));
        assert!(out.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let stack = stack(44);
        let cond = signal(80, 0.2);
        let z = signal(80, 0.9);

        let sequential = ChunkedInferenceController::new(chunking(16, 8), 8).unwrap();
        let parallel = ChunkedInferenceController::new(
            ChunkConfig {
                parallel: true,
                ..chunking(16, 8)
            },
            8,
        )
        .unwrap();

        assert_eq!(
            sequential.generate(&stack, cond.view(), z.view()).unwrap(),
            parallel.generate(&stack, cond.view(), z.view()).unwrap()
        );
    }

    #[test]
    fn test_rejects_bad_configuration() {
        assert!(matches!(
            ChunkedInferenceController::new(chunking(100, 5), 8),
            Err(FlowError::Configuration(_))
        ));

        let stack = stack(45);
        let controller = ChunkedInferenceController::new(chunking(12, 6), 6).unwrap();
        let x = signal(24, 0.0);
        assert!(matches!(
            controller.generate(&stack, x.view(), x.view()),
            Err(FlowError::Configuration(_))
        ));
    }

    #[test]
    fn test_empty_signal() {
        let stack = stack(46);
        let controller = ChunkedInferenceController::new(chunking(16, 8), 8).unwrap();
        let empty = Array2::<f32>::zeros((1, 0));
        let out = controller.generate(&stack, empty.view(), empty.view()).unwrap();
        assert_eq!(out.dim(), (1, 0));
    }
}
