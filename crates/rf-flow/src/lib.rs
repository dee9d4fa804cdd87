//! # rf-flow
//!
//! Conditional normalizing flow over channel-grouped audio:
//! - `InvertibleChannelMix`: learned 1x1 channel rotation with tracked log-determinant
//! - `AffineCoupling`: conditioned scale/shift of half the channels by a dilated residual net
//! - `FlowStack`: ordered mix + coupling steps with optional early channel emission
//! - `ChunkedInferenceController`: windowed reverse pass for long signals
//!
//! ## Shapes
//!
//! Flat signals are `(batch, samples)` and must divide by the group size `G`
//! before entering a stack. Inside, state is `(batch, channels, samples / G)`.
//!
//! ```text
//! x (B, N) ── group ──> (B, G, N/G) ── steps ──> (B, G, N/G) ── flatten ──> z (B, N)
//! ```

#![allow(missing_docs)]

pub mod channel_mix;
pub mod chunked;
pub mod config;
pub mod conv;
pub mod coupling;
pub mod params;
pub mod stack;
pub mod tensor;
pub mod verify;

mod error;

pub use channel_mix::InvertibleChannelMix;
pub use chunked::{ChunkWindow, ChunkedInferenceController};
pub use config::{ChunkConfig, DilationSchedule, FlowConfig, SubnetConfig};
pub use conv::Conv1d;
pub use coupling::{AffineCoupling, CouplingNet, ResidualBlock};
pub use error::{FlowError, FlowResult};
pub use params::{ParamTensor, ParameterMap};
pub use stack::{FlowOutput, FlowStack, FlowStep};
pub use verify::{LayerCheck, LayerKind, ReconstructionReport};
