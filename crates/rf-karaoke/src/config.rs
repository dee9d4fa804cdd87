//! Separation engine configuration

use std::fs;
use std::path::Path;

use rf_flow::{ChunkConfig, FlowConfig, SubnetConfig};
use serde::{Deserialize, Serialize};

use crate::error::{SeparationError, SeparationResult};

/// Gaussian prior on the latent
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriorConfig {
    /// Standard deviation assumed by the training loss
    pub train_std: f32,
    /// Standard deviation of the noise drawn at inference
    pub eval_std: f32,
}

impl Default for PriorConfig {
    fn default() -> Self {
        Self {
            train_std: 1.0,
            eval_std: 0.6,
        }
    }
}

/// Separation engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeparationConfig {
    /// Flow stack layout
    pub flow: FlowConfig,

    /// Latent prior
    pub prior: PriorConfig,

    /// Windowing of the inference pass
    pub chunking: ChunkConfig,

    /// Run the reverse self-check on every training step
    pub debug: bool,

    /// Parameter init seed (OS entropy when absent)
    pub seed: Option<u64>,
}

impl Default for SeparationConfig {
    fn default() -> Self {
        Self {
            flow: FlowConfig::default(),
            prior: PriorConfig::default(),
            chunking: ChunkConfig::default(),
            debug: false,
            seed: None,
        }
    }
}

impl SeparationConfig {
    /// Small network for tests and quick CPU experiments
    pub fn lightweight() -> Self {
        Self {
            flow: FlowConfig {
                num_flows: 4,
                subnet: SubnetConfig {
                    depth: 4,
                    width: 32,
                    ..SubnetConfig::default()
                },
                ..FlowConfig::default()
            },
            chunking: ChunkConfig {
                chunk_size: 4_000,
                context_margin: 1_000,
                parallel: false,
            },
            ..Self::default()
        }
    }

    /// Builder: fixed init seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Builder: reverse self-check on training steps
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn group_size(&self) -> usize {
        self.flow.group_size
    }

    pub fn validate(&self) -> SeparationResult<()> {
        self.flow
            .validate()
            .map_err(|e| SeparationError::InvalidConfig(e.to_string()))?;
        self.chunking
            .validate(self.flow.group_size)
            .map_err(|e| SeparationError::InvalidConfig(e.to_string()))?;

        let PriorConfig {
            train_std,
            eval_std,
        } = self.prior;
        if !(train_std.is_finite() && train_std > 0.0) {
            return Err(SeparationError::InvalidConfig(format!(
                "training prior std must be positive, got {train_std}"
            )));
        }
        if !(eval_std.is_finite() && eval_std > 0.0) {
            return Err(SeparationError::InvalidConfig(format!(
                "inference prior std must be positive, got {eval_std}"
            )));
        }
        if eval_std > train_std {
            log::warn!(
                "Inference prior std {eval_std} exceeds training std {train_std}; output will be noisier"
            );
        }
        Ok(())
    }

    /// Load from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> SeparationResult<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Write as pretty JSON
    pub fn to_json_file(&self, path: impl AsRef<Path>) -> SeparationResult<()> {
        fs::write(path.as_ref(), serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SeparationConfig::default();
        assert_eq!(config.flow.num_flows, 6);
        assert_eq!(config.group_size(), 8);
        assert_eq!(config.flow.subnet.depth, 8);
        assert_eq!(config.flow.subnet.width, 512);
        assert!(config.flow.emit_steps.is_empty());
        assert_eq!(config.flow.emit_channels, 2);
        assert_eq!(config.prior.train_std, 1.0);
        assert_eq!(config.prior.eval_std, 0.6);
        assert_eq!(config.chunking.chunk_size, 16_000);
        assert_eq!(config.chunking.context_margin, 4_000);
        assert!(config.validate().is_ok());
        assert!(SeparationConfig::lightweight().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = SeparationConfig::lightweight();
        config.prior.eval_std = 0.0;
        assert!(matches!(
            config.validate(),
            Err(SeparationError::InvalidConfig(_))
        ));

        let mut config = SeparationConfig::lightweight();
        config.chunking.context_margin = 3;
        assert!(matches!(
            config.validate(),
            Err(SeparationError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: SeparationConfig =
            serde_json::from_str(r#"{ "debug": true, "seed": 7 }"#).unwrap();
        assert!(config.debug);
        assert_eq!(config.seed, Some(7));
        assert_eq!(config.flow, FlowConfig::default());
    }
}
