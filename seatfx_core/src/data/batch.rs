//! One loader step: covariates, zone blocks, treatments and outcomes.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use ndarray::{Array2, Array3, ArrayD, Axis, Ix2, Ix3};
use serde::{Deserialize, Serialize};

use crate::error::{EffectError, EffectResult};

/// Seating zones extracted from an evacuation scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneKey {
    Tf,
    Ph1f,
    Ph2f,
    Oh1f,
    Oh2f,
    Oh3f,
    Oh4f,
}

impl ZoneKey {
    pub const ALL: [ZoneKey; 7] = [
        ZoneKey::Tf,
        ZoneKey::Ph1f,
        ZoneKey::Ph2f,
        ZoneKey::Oh1f,
        ZoneKey::Oh2f,
        ZoneKey::Oh3f,
        ZoneKey::Oh4f,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ZoneKey::Tf => "tf",
            ZoneKey::Ph1f => "ph1f",
            ZoneKey::Ph2f => "ph2f",
            ZoneKey::Oh1f => "oh1f",
            ZoneKey::Oh2f => "oh2f",
            ZoneKey::Oh3f => "oh3f",
            ZoneKey::Oh4f => "oh4f",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|key| key.name() == name)
    }
}

impl fmt::Display for ZoneKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Samples of one loader step.
///
/// `covariate` and every zone share the sample count `N`; `treatment`,
/// `outcome` and `mean` share `N_t`, which may differ from `N` when one unit is
/// evaluated under several treatments.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub covariate: Array2<f32>,
    pub zones: BTreeMap<ZoneKey, Array3<f32>>,
    pub treatment: Array2<f32>,
    pub outcome: Array2<f32>,
    pub mean: Array2<f32>,
}

fn take_rank<D: ndarray::Dimension>(
    tensors: &HashMap<String, ArrayD<f32>>,
    key: &str,
    rank: usize,
) -> EffectResult<Option<ndarray::Array<f32, D>>> {
    let Some(tensor) = tensors.get(key) else {
        return Ok(None);
    };
    let mut tensor = tensor.clone();
    if tensor.ndim() == rank + 1 && tensor.shape()[0] == 1 {
        tensor = tensor.index_axis_move(Axis(0), 0);
    }
    let shape = tensor.shape().to_vec();
    tensor
        .into_dimensionality::<D>()
        .map(Some)
        .map_err(|_| EffectError::shape_mismatch(format!("rank {}", rank), shape, key.to_string()))
}

fn require<T>(value: Option<T>, key: &str) -> EffectResult<T> {
    value.ok_or_else(|| EffectError::shape_mismatch(key, "missing", "batch tensors"))
}

impl Batch {
    pub fn samples(&self) -> usize {
        self.covariate.nrows()
    }

    pub fn treated_samples(&self) -> usize {
        self.treatment.nrows()
    }

    pub fn zone(&self, key: ZoneKey) -> EffectResult<&Array3<f32>> {
        self.zones
            .get(&key)
            .ok_or_else(|| EffectError::shape_mismatch(key.name(), "missing", "batch zones"))
    }

    /// Builds a batch from named dynamic tensors.
    ///
    /// Recognized keys are `covariate`, `treatment`, `outcome`, `mean` and the
    /// zone names. A leading singleton axis is squeezed.
    pub fn from_named(tensors: &HashMap<String, ArrayD<f32>>) -> EffectResult<Self> {
        let covariate = require(take_rank::<Ix2>(tensors, "covariate", 2)?, "covariate")?;
        let treatment = require(take_rank::<Ix2>(tensors, "treatment", 2)?, "treatment")?;
        let outcome = require(take_rank::<Ix2>(tensors, "outcome", 2)?, "outcome")?;
        let mean = require(take_rank::<Ix2>(tensors, "mean", 2)?, "mean")?;

        let mut zones = BTreeMap::new();
        for key in ZoneKey::ALL {
            if let Some(block) = take_rank::<Ix3>(tensors, key.name(), 3)? {
                zones.insert(key, block);
            }
        }

        let batch = Self {
            covariate,
            zones,
            treatment,
            outcome,
            mean,
        };
        batch.validate()?;
        Ok(batch)
    }

    /// Checks that sample counts agree within each group of tensors.
    pub fn validate(&self) -> EffectResult<()> {
        let n = self.samples();
        for (key, block) in &self.zones {
            if block.len_of(Axis(0)) != n {
                return Err(EffectError::shape_mismatch(
                    n,
                    block.len_of(Axis(0)),
                    format!("zone {} samples", key),
                ));
            }
        }
        if self.outcome.nrows() != self.treatment.nrows() {
            return Err(EffectError::shape_mismatch(
                self.treatment.nrows(),
                self.outcome.nrows(),
                "outcome rows",
            ));
        }
        if self.mean.dim() != self.outcome.dim() {
            return Err(EffectError::shape_mismatch(
                self.outcome.dim(),
                self.mean.dim(),
                "mean outcome",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(entries: Vec<(&str, ArrayD<f32>)>) -> HashMap<String, ArrayD<f32>> {
        entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }

    #[test]
    fn zone_names_round_trip() {
        for key in ZoneKey::ALL {
            assert_eq!(ZoneKey::from_name(key.name()), Some(key));
        }
        assert_eq!(ZoneKey::from_name("oh5f"), None);
    }

    #[test]
    fn squeezes_loader_axis() {
        let tensors = named(vec![
            ("covariate", ArrayD::zeros(vec![1, 4, 6])),
            ("tf", ArrayD::zeros(vec![1, 4, 8, 3])),
            ("treatment", ArrayD::zeros(vec![1, 4, 2])),
            ("outcome", ArrayD::zeros(vec![4, 10])),
            ("mean", ArrayD::zeros(vec![4, 10])),
        ]);
        let batch = Batch::from_named(&tensors).unwrap();
        assert_eq!(batch.covariate.dim(), (4, 6));
        assert_eq!(batch.zone(ZoneKey::Tf).unwrap().dim(), (4, 8, 3));
        assert!(batch.zone(ZoneKey::Oh1f).is_err());
    }

    #[test]
    fn missing_key_is_shape_mismatch() {
        let tensors = named(vec![("covariate", ArrayD::zeros(vec![4, 6]))]);
        assert!(matches!(
            Batch::from_named(&tensors),
            Err(EffectError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn wrong_rank_is_shape_mismatch() {
        let tensors = named(vec![
            ("covariate", ArrayD::zeros(vec![4, 6])),
            ("tf", ArrayD::zeros(vec![4, 8])),
            ("treatment", ArrayD::zeros(vec![4, 2])),
            ("outcome", ArrayD::zeros(vec![4, 10])),
            ("mean", ArrayD::zeros(vec![4, 10])),
        ]);
        assert!(matches!(
            Batch::from_named(&tensors),
            Err(EffectError::ShapeMismatch { .. })
        ));
    }
}
