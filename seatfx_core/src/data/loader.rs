//! Batch sources consumed by the trainer and the scoring engine.

use super::batch::Batch;
use crate::error::{EffectError, EffectResult};

/// Indexed, blocking source of batches.
pub trait BatchLoader: Send + Sync {
    fn num_batches(&self) -> usize;

    fn load(&self, index: usize) -> EffectResult<Batch>;

    fn is_empty(&self) -> bool {
        self.num_batches() == 0
    }
}

/// Loader over batches held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLoader {
    batches: Vec<Batch>,
}

impl InMemoryLoader {
    pub fn new(batches: Vec<Batch>) -> Self {
        Self { batches }
    }

    pub fn batches(&self) -> &[Batch] {
        &self.batches
    }
}

impl BatchLoader for InMemoryLoader {
    fn num_batches(&self) -> usize {
        self.batches.len()
    }

    fn load(&self, index: usize) -> EffectResult<Batch> {
        self.batches.get(index).cloned().ok_or_else(|| {
            EffectError::shape_mismatch(
                format!("index below {}", self.batches.len()),
                index,
                "batch loader",
            )
        })
    }
}

/// The four loaders of a run.
///
/// `within` and `without` hold one unit per batch evaluated under every
/// treatment, for in-sample and out-of-sample scoring.
pub struct LoaderSet {
    pub train: Box<dyn BatchLoader>,
    pub valid: Box<dyn BatchLoader>,
    pub within: Box<dyn BatchLoader>,
    pub without: Box<dyn BatchLoader>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use std::collections::BTreeMap;

    #[test]
    fn out_of_range_index_fails() {
        let batch = Batch {
            covariate: Array2::zeros((1, 2)),
            zones: BTreeMap::new(),
            treatment: Array2::zeros((1, 2)),
            outcome: Array2::zeros((1, 3)),
            mean: Array2::zeros((1, 3)),
        };
        let loader = InMemoryLoader::new(vec![batch]);
        assert_eq!(loader.num_batches(), 1);
        assert!(loader.load(0).is_ok());
        assert!(loader.load(1).is_err());
        assert!(InMemoryLoader::default().is_empty());
    }
}
