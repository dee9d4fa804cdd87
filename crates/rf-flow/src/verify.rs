//! Post-hoc reverse self-check
//!
//! Replays a forward pass layer by layer and undoes every layer right after
//! applying it. The report is diagnostic only; `FlowStack::forward` and
//! `FlowStack::inverse` never run this code.

use ndarray::{ArrayView2, ArrayView3};

use crate::error::FlowResult;
use crate::stack::FlowStack;
use crate::tensor::max_abs_diff;

/// Layer inside a flow step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    Mix,
    Coupling,
}

impl LayerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LayerKind::Mix => "conv",
            LayerKind::Coupling => "coupling",
        }
    }
}

/// Reconstruction error of one layer
#[derive(Debug, Clone, PartialEq)]
pub struct LayerCheck {
    pub step: usize,
    pub layer: LayerKind,
    pub max_abs_error: f32,
}

impl LayerCheck {
    /// Metric tag, e.g. `reverse/coupling_3`
    pub fn tag(&self) -> String {
        format!("reverse/{}_{}", self.layer.as_str(), self.step)
    }
}

/// Per-layer and end-to-end reconstruction errors
#[derive(Debug, Clone, PartialEq)]
pub struct ReconstructionReport {
    pub layers: Vec<LayerCheck>,
    /// `max |x - inverse(forward(x))|` over the whole stack
    pub end_to_end: f32,
}

impl ReconstructionReport {
    /// Worst error over every layer and the full round trip
    pub fn worst(&self) -> f32 {
        self.layers
            .iter()
            .map(|l| l.max_abs_error)
            .fold(self.end_to_end, f32::max)
    }
}

impl FlowStack {
    /// Run the forward pass with an inverse check after every layer
    pub fn verify_reconstruction(
        &self,
        conditioning: ArrayView2<f32>,
        x: ArrayView2<f32>,
    ) -> FlowResult<ReconstructionReport> {
        let (cond, mut state) = self.prepare(conditioning, x)?;
        let mut layers = Vec::with_capacity(2 * self.steps.len());

        for (i, step) in self.steps.iter().enumerate() {
            if step.emits() {
                state = self.emit(state).1;
            }

            let (mixed, _) = step.mix.forward(state.view())?;
            let undone = step.mix.inverse(mixed.view())?;
            layers.push(LayerCheck {
                step: i,
                layer: LayerKind::Mix,
                max_abs_error: error(state.view(), undone.view()),
            });

            let (coupled, _) = step.coupling.forward(cond.view(), mixed.view())?;
            let undone = step.coupling.inverse(cond.view(), coupled.view())?;
            layers.push(LayerCheck {
                step: i,
                layer: LayerKind::Coupling,
                max_abs_error: error(mixed.view(), undone.view()),
            });

            state = coupled;
        }

        let latent = self.forward(conditioning, x)?.latent;
        let restored = self.inverse(conditioning, latent.view())?;
        let end_to_end = max_abs_diff(x.into_dyn(), restored.view().into_dyn());

        Ok(ReconstructionReport { layers, end_to_end })
    }
}

fn error(expected: ArrayView3<f32>, got: ArrayView3<f32>) -> f32 {
    max_abs_diff(expected.into_dyn(), got.into_dyn())
}
