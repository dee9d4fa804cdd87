//! # rf-karaoke
//!
//! Accompaniment extraction with a conditional normalizing flow:
//! - Training: likelihood of `target - mixed` given the mix, under a Gaussian latent prior
//! - Separation: Gaussian noise at a sharpened std, chunked inverse flow, mix added back
//!
//! ## Usage
//!
//! ```rust,ignore
//! use rf_karaoke::{SeparationConfig, SeparationEngine};
//!
//! let mut engine = SeparationEngine::new(SeparationConfig::default())?;
//! engine.load_weights("weights.json")?;
//! let karaoke = engine.separate_interleaved(&audio, 2)?;
//! ```

#![allow(missing_docs)]

pub mod config;
pub mod context;
pub mod data;
pub mod engine;

mod error;

pub use config::{PriorConfig, SeparationConfig};
pub use context::{
    LogSink, MetricPoint, MetricsSink, NullSink, RecordingSink, RunMode, TrainingContext,
};
pub use data::{SongWindow, stack_windows};
pub use engine::{LossBreakdown, Separated, SeparationEngine};
pub use error::{SeparationError, SeparationResult};
