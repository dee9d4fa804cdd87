//! Flow stack and chunking configuration

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, FlowResult};

/// Dilation applied to each residual block of the coupling network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DilationSchedule {
    /// Block `i` uses `base^(first_exponent + i)`
    Exponential { base: usize, first_exponent: u32 },
    /// One explicit dilation per block
    Explicit { dilations: Vec<usize> },
}

impl Default for DilationSchedule {
    fn default() -> Self {
        DilationSchedule::Exponential {
            base: 2,
            first_exponent: 1,
        }
    }
}

impl DilationSchedule {
    /// Dilations for a network of `depth` blocks
    pub fn dilations(&self, depth: usize) -> FlowResult<Vec<usize>> {
        match self {
            DilationSchedule::Exponential {
                base,
                first_exponent,
            } => (0..depth)
                .map(|i| {
                    base.checked_pow(first_exponent + i as u32).ok_or_else(|| {
                        FlowError::Configuration(format!("dilation overflow at block {i}"))
                    })
                })
                .collect(),
            DilationSchedule::Explicit { dilations } => {
                if dilations.len() != depth {
                    return Err(FlowError::Configuration(format!(
                        "dilation schedule lists {} entries for {depth} blocks",
                        dilations.len()
                    )));
                }
                Ok(dilations.clone())
            }
        }
    }
}

/// Coupling sub-network shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubnetConfig {
    /// Number of dilated residual blocks
    pub depth: usize,
    /// Hidden channel count
    pub width: usize,
    /// Kernel size of the dilated convolutions (odd)
    pub kernel_size: usize,
    /// Per-block dilation
    pub dilation: DilationSchedule,
}

impl Default for SubnetConfig {
    fn default() -> Self {
        Self {
            depth: 8,
            width: 512,
            kernel_size: 3,
            dilation: DilationSchedule::default(),
        }
    }
}

impl SubnetConfig {
    /// Receptive field in frames of one coupling network
    pub fn receptive_field(&self) -> FlowResult<usize> {
        let dilations = self.dilation.dilations(self.depth)?;
        Ok(1 + dilations
            .iter()
            .map(|d| (self.kernel_size.saturating_sub(1)) * d)
            .sum::<usize>())
    }

    pub fn validate(&self) -> FlowResult<()> {
        if self.width == 0 {
            return Err(FlowError::Configuration("subnet width must be positive".into()));
        }
        if self.kernel_size % 2 == 0 {
            return Err(FlowError::Configuration(format!(
                "subnet kernel size must be odd, got {}",
                self.kernel_size
            )));
        }
        let dilations = self.dilation.dilations(self.depth)?;
        if dilations.contains(&0) {
            return Err(FlowError::Configuration("dilations must be at least 1".into()));
        }
        Ok(())
    }
}

/// FlowStack configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Number of (mix, coupling) steps
    pub num_flows: usize,
    /// Channel-group size `G`; every flat length must divide by it
    pub group_size: usize,
    /// Steps before which `emit_channels` channels leave the flow
    pub emit_steps: Vec<usize>,
    /// Channels removed at each emission step
    pub emit_channels: usize,
    /// Coupling network shape
    pub subnet: SubnetConfig,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            num_flows: 6,
            group_size: 8,
            emit_steps: Vec::new(),
            emit_channels: 2,
            subnet: SubnetConfig::default(),
        }
    }
}

impl FlowConfig {
    /// Whether channels leave the flow before step `step`
    pub fn emits_at(&self, step: usize) -> bool {
        self.emit_steps.contains(&step)
    }

    /// Channels still flowing through step `step`
    pub fn channels_at(&self, step: usize) -> usize {
        let emitted = self.emit_steps.iter().filter(|&&s| s <= step).count();
        self.group_size.saturating_sub(emitted * self.emit_channels)
    }

    /// Channels left after the final step
    pub fn final_channels(&self) -> usize {
        self.group_size.saturating_sub(self.emit_steps.len() * self.emit_channels)
    }

    pub fn validate(&self) -> FlowResult<()> {
        if self.num_flows == 0 {
            return Err(FlowError::Configuration("need at least one flow step".into()));
        }
        if self.group_size == 0 || self.group_size % 2 != 0 {
            return Err(FlowError::Configuration(format!(
                "group size must be even and positive, got {}",
                self.group_size
            )));
        }

        let mut seen = self.emit_steps.clone();
        seen.sort_unstable();
        seen.dedup();
        if seen.len() != self.emit_steps.len() {
            return Err(FlowError::Configuration("duplicate emission step".into()));
        }
        if let Some(&step) = seen.iter().find(|&&s| s >= self.num_flows) {
            return Err(FlowError::Configuration(format!(
                "emission step {step} outside {} flow steps",
                self.num_flows
            )));
        }
        if !self.emit_steps.is_empty() {
            if self.emit_channels == 0 || self.emit_channels % 2 != 0 {
                return Err(FlowError::Configuration(format!(
                    "emitted channel count must be even and positive, got {}",
                    self.emit_channels
                )));
            }
            let removed = self.emit_steps.len() * self.emit_channels;
            if removed >= self.group_size {
                return Err(FlowError::Configuration(format!(
                    "emissions remove {removed} of {} channels",
                    self.group_size
                )));
            }
        }

        self.subnet.validate()
    }
}

/// Long-sequence reverse pass windowing, in flat samples
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkConfig {
    /// Output samples produced per window
    pub chunk_size: usize,
    /// Extra samples on each side, discarded after the pass
    pub context_margin: usize,
    /// Run windows on the rayon pool
    pub parallel: bool,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size: 16_000,
            context_margin: 4_000,
            parallel: false,
        }
    }
}

impl ChunkConfig {
    /// Check divisibility against the channel-group size
    pub fn validate(&self, group_size: usize) -> FlowResult<()> {
        if self.chunk_size == 0 {
            return Err(FlowError::Configuration("chunk size must be positive".into()));
        }
        if group_size == 0 {
            return Err(FlowError::Configuration("group size must be positive".into()));
        }
        let window = self.chunk_size + 2 * self.context_margin;
        if window % group_size != 0 {
            return Err(FlowError::Configuration(format!(
                "chunk {} + 2 x context {} = {window} is not a multiple of group size {group_size}",
                self.chunk_size, self.context_margin
            )));
        }
        // clamped edge windows drop one margin; keep those divisible too
        if self.chunk_size % group_size != 0 || self.context_margin % group_size != 0 {
            return Err(FlowError::Configuration(format!(
                "chunk {} and context {} must each be multiples of group size {group_size}",
                self.chunk_size, self.context_margin
            )));
        }
        Ok(())
    }
}
