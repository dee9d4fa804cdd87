//! Per-call training context and metric sinks
//!
//! The engine holds no mode flag and writes no global summaries. Callers pass
//! a `TrainingContext` carrying the run mode, the step counter and wherever
//! scalar metrics should go.

/// Whether a call is part of training or evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    #[default]
    Train,
    Eval,
}

/// Destination for scalar metrics
pub trait MetricsSink {
    fn scalar(&mut self, tag: &str, value: f64, step: u64);
}

/// Drops every metric
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn scalar(&mut self, _tag: &str, _value: f64, _step: u64) {}
}

/// Forwards metrics to the `log` facade at debug level
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl MetricsSink for LogSink {
    fn scalar(&mut self, tag: &str, value: f64, step: u64) {
        log::debug!("[step {step}] {tag} = {value}");
    }
}

/// One recorded metric
#[derive(Debug, Clone, PartialEq)]
pub struct MetricPoint {
    pub tag: String,
    pub step: u64,
    pub value: f64,
}

/// Keeps every metric in memory
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    points: Vec<MetricPoint>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn points(&self) -> &[MetricPoint] {
        &self.points
    }

    /// Values recorded under `tag`, oldest first
    pub fn values(&self, tag: &str) -> Vec<f64> {
        self.points
            .iter()
            .filter(|p| p.tag == tag)
            .map(|p| p.value)
            .collect()
    }

    /// Most recent value under `tag`
    pub fn last(&self, tag: &str) -> Option<f64> {
        self.points.iter().rev().find(|p| p.tag == tag).map(|p| p.value)
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }
}

impl MetricsSink for RecordingSink {
    fn scalar(&mut self, tag: &str, value: f64, step: u64) {
        self.points.push(MetricPoint {
            tag: tag.to_string(),
            step,
            value,
        });
    }
}

/// Mode, step counter and metric sink for one run
#[derive(Debug, Clone, Default)]
pub struct TrainingContext<S: MetricsSink = NullSink> {
    mode: RunMode,
    step: u64,
    sink: S,
}

impl TrainingContext<NullSink> {
    /// Training context that discards metrics
    pub fn train() -> Self {
        Self::with_sink(RunMode::Train, NullSink)
    }

    /// Evaluation context that discards metrics
    pub fn eval() -> Self {
        Self::with_sink(RunMode::Eval, NullSink)
    }
}

impl<S: MetricsSink> TrainingContext<S> {
    pub fn with_sink(mode: RunMode, sink: S) -> Self {
        Self { mode, step: 0, sink }
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: RunMode) {
        self.mode = mode;
    }

    pub fn is_training(&self) -> bool {
        self.mode == RunMode::Train
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    /// Move to the next step; returns the new step
    pub fn advance(&mut self) -> u64 {
        self.step += 1;
        self.step
    }

    /// Record a scalar at the current step
    pub fn record(&mut self, tag: &str, value: f64) {
        self.sink.scalar(tag, value, self.step);
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }
}
