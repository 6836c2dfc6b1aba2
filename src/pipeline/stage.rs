//! Pipeline stages and the tracker that walks through them.

use std::fmt;

use crate::error::GsvqError;

/// Every state a compress or decompress run passes through.
///
/// Compress: `Idle → Quantizing → LayoutBuilding → Encoding → Persisted`.
/// Decompress: `Idle → Decoding → Parsing → Dequantizing → Applied`.
/// Any error moves the run to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineStage {
    Idle,
    Quantizing,
    LayoutBuilding,
    Encoding,
    Persisted,
    Decoding,
    Parsing,
    Dequantizing,
    Applied,
    Failed,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Records the stages of one run and wraps failures with the stage they hit.
#[derive(Debug)]
pub(crate) struct StageTracker {
    run: &'static str,
    history: Vec<PipelineStage>,
}

impl StageTracker {
    pub(crate) fn new(run: &'static str) -> Self {
        Self {
            run,
            history: vec![PipelineStage::Idle],
        }
    }

    pub(crate) fn current(&self) -> PipelineStage {
        self.history
            .last()
            .copied()
            .unwrap_or(PipelineStage::Idle)
    }

    fn enter(&mut self, stage: PipelineStage) {
        log::debug!("{}: {} -> {}", self.run, self.current(), stage);
        self.history.push(stage);
    }

    /// Enters `stage` and runs `step`. A failure moves the run to `Failed` and
    /// comes back as `GsvqError::Pipeline` naming `stage`.
    pub(crate) fn run<T>(
        &mut self,
        stage: PipelineStage,
        step: impl FnOnce() -> Result<T, GsvqError>,
    ) -> Result<T, GsvqError> {
        self.enter(stage);
        step().map_err(|source| {
            log::error!("{} failed at stage {}: {}", self.run, stage, source);
            self.history.push(PipelineStage::Failed);
            GsvqError::Pipeline {
                stage,
                source: Box::new(source),
            }
        })
    }

    pub(crate) fn into_history(self) -> Vec<PipelineStage> {
        self.history
    }
}
