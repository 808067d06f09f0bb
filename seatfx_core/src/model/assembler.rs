//! Zone representation assembler.
//!
//! Every zone block of a batch is run through one shared encoder. Zones are
//! then averaged into node slots and the stacked `[N, nodes, features]`
//! tensor is layer-normalized per sample.

use std::collections::{BTreeMap, BTreeSet};

use ndarray::{s, Array2, Array3, Axis};
use serde::{Deserialize, Serialize};

use super::RepresentationStage;
use crate::data::{Batch, ZoneKey};
use crate::error::{EffectError, EffectResult};
use crate::nn::layer_norm::LayerNormTrace;
use crate::nn::mlp::PooledTrace;
use crate::nn::param::scoped;
use crate::nn::{LayerNorm, ParamMut, Parameterized, PooledMlp};

/// Zero padding applied to a zone on its positional axis before encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZonePadding {
    pub zone: ZoneKey,
    pub before: usize,
    pub after: usize,
}

/// Which zones feed which node, and which zones are padded.
///
/// Each slot is one node; a slot with several zones holds their average.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneLayout {
    pub slots: Vec<Vec<ZoneKey>>,
    pub padding: Vec<ZonePadding>,
}

impl Default for ZoneLayout {
    fn default() -> Self {
        Self {
            slots: vec![
                vec![ZoneKey::Tf],
                vec![ZoneKey::Ph1f, ZoneKey::Ph2f],
                vec![ZoneKey::Oh4f, ZoneKey::Oh3f],
                vec![ZoneKey::Oh2f],
                vec![ZoneKey::Oh1f],
            ],
            padding: vec![ZonePadding {
                zone: ZoneKey::Ph2f,
                before: 5,
                after: 5,
            }],
        }
    }
}

impl ZoneLayout {
    pub fn nodes(&self) -> usize {
        self.slots.len()
    }

    /// Distinct zones referenced by any slot.
    pub fn zones(&self) -> BTreeSet<ZoneKey> {
        self.slots.iter().flatten().copied().collect()
    }

    pub fn validate(&self) -> EffectResult<()> {
        if self.slots.is_empty() || self.slots.iter().any(|slot| slot.is_empty()) {
            return Err(EffectError::shape_mismatch(
                "non-empty slots",
                &self.slots,
                "zone layout",
            ));
        }
        Ok(())
    }

    fn padding_for(&self, zone: ZoneKey) -> (usize, usize) {
        self.padding
            .iter()
            .find(|p| p.zone == zone)
            .map(|p| (p.before, p.after))
            .unwrap_or((0, 0))
    }
}

/// Zero-pads `block` on axis 1.
pub fn pad_positions(block: &Array3<f32>, before: usize, after: usize) -> Array3<f32> {
    if before == 0 && after == 0 {
        return block.clone();
    }
    let (n, positions, channels) = block.dim();
    let mut padded = Array3::zeros((n, before + positions + after, channels));
    padded
        .slice_mut(s![.., before..before + positions, ..])
        .assign(block);
    padded
}

struct AssemblerTrace {
    zones: BTreeMap<ZoneKey, PooledTrace>,
    norm: LayerNormTrace,
    samples: usize,
}

pub struct ZoneAssembler {
    layout: ZoneLayout,
    encoder: PooledMlp,
    norm: LayerNorm,
    trace: Option<AssemblerTrace>,
}

impl ZoneAssembler {
    pub fn new(
        layout: ZoneLayout,
        channels: usize,
        hidden: usize,
        features: usize,
        seed: u64,
    ) -> EffectResult<Self> {
        layout.validate()?;
        let nodes = layout.nodes();
        Ok(Self {
            layout,
            encoder: PooledMlp::new(channels, hidden, features, seed),
            norm: LayerNorm::new(nodes, features),
            trace: None,
        })
    }

    pub fn layout(&self) -> &ZoneLayout {
        &self.layout
    }
}

impl RepresentationStage for ZoneAssembler {
    fn nodes(&self) -> usize {
        self.layout.nodes()
    }

    fn features(&self) -> usize {
        self.encoder.features()
    }

    fn forward(&mut self, batch: &Batch) -> EffectResult<Array3<f32>> {
        let samples = batch.samples();
        let mut encoded = BTreeMap::new();
        let mut traces = BTreeMap::new();
        for zone in self.layout.zones() {
            let (before, after) = self.layout.padding_for(zone);
            let block = pad_positions(batch.zone(zone)?, before, after);
            if block.len_of(Axis(0)) != samples {
                return Err(EffectError::shape_mismatch(
                    samples,
                    block.len_of(Axis(0)),
                    format!("zone {} samples", zone),
                ));
            }
            let (features, trace) = self.encoder.forward(&block)?;
            encoded.insert(zone, features);
            traces.insert(zone, trace);
        }

        let features = self.encoder.features();
        let mut stacked = Array3::zeros((samples, self.layout.nodes(), features));
        for (node, slot) in self.layout.slots.iter().enumerate() {
            let mut sum = Array2::<f32>::zeros((samples, features));
            for zone in slot {
                if let Some(value) = encoded.get(zone) {
                    sum += value;
                }
            }
            sum /= slot.len() as f32;
            stacked.slice_mut(s![.., node, ..]).assign(&sum);
        }

        let (normalized, norm) = self.norm.forward(&stacked)?;
        self.trace = Some(AssemblerTrace {
            zones: traces,
            norm,
            samples,
        });
        Ok(normalized)
    }

    fn backward(&mut self, grad: &Array3<f32>) -> EffectResult<()> {
        let trace = self
            .trace
            .take()
            .ok_or_else(|| EffectError::missing_forward("zone assembler"))?;
        let grad_stacked = self.norm.backward(&trace.norm, grad);

        let features = self.encoder.features();
        let mut per_zone: BTreeMap<ZoneKey, Array2<f32>> = BTreeMap::new();
        for (node, slot) in self.layout.slots.iter().enumerate() {
            let share = grad_stacked.slice(s![.., node, ..]).to_owned() / slot.len() as f32;
            for zone in slot {
                *per_zone
                    .entry(*zone)
                    .or_insert_with(|| Array2::zeros((trace.samples, features))) += &share;
            }
        }

        for (zone, zone_grad) in per_zone {
            if let Some(zone_trace) = trace.zones.get(&zone) {
                self.encoder.backward(zone_trace, &zone_grad)?;
            }
        }
        Ok(())
    }

    fn params_mut(&mut self, prefix: &str) -> Vec<ParamMut<'_>> {
        let mut params = self.encoder.params_mut(&scoped(prefix, "encoder"));
        params.extend(self.norm.params_mut(&scoped(prefix, "norm")));
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn zone_batch(samples: usize) -> Batch {
        let mut zones = BTreeMap::new();
        for (i, key) in ZoneKey::ALL.iter().enumerate() {
            let positions = if *key == ZoneKey::Ph2f { 4 } else { 6 + i };
            zones.insert(
                *key,
                Array3::from_shape_fn((samples, positions, 3), |(n, p, c)| {
                    ((n + 1) as f32 * 0.3 + p as f32 * 0.1 - c as f32 * 0.2 + i as f32).sin()
                }),
            );
        }
        Batch {
            covariate: Array2::zeros((samples, 2)),
            zones,
            treatment: Array2::zeros((samples, 2)),
            outcome: Array2::zeros((samples, 3)),
            mean: Array2::zeros((samples, 3)),
        }
    }

    #[test]
    fn padding_surrounds_block_with_zeros() {
        let block = Array3::ones((1, 2, 1));
        let padded = pad_positions(&block, 5, 5);
        assert_eq!(padded.dim(), (1, 12, 1));
        assert_eq!(padded.sum(), 2.0);
        assert_eq!(padded[[0, 5, 0]], 1.0);
        assert_eq!(padded[[0, 4, 0]], 0.0);
    }

    #[test]
    fn default_layout_has_five_nodes_over_seven_zones() {
        let layout = ZoneLayout::default();
        assert_eq!(layout.nodes(), 5);
        assert_eq!(layout.zones().len(), 7);
    }

    #[test]
    fn representation_shape_is_independent_of_batch_size() {
        let mut assembler = ZoneAssembler::new(ZoneLayout::default(), 3, 8, 4, 0).unwrap();
        assert_eq!(assembler.forward(&zone_batch(2)).unwrap().dim(), (2, 5, 4));
        assert_eq!(assembler.forward(&zone_batch(7)).unwrap().dim(), (7, 5, 4));
    }

    #[test]
    fn missing_zone_is_shape_mismatch() {
        let mut assembler = ZoneAssembler::new(ZoneLayout::default(), 3, 8, 4, 0).unwrap();
        let mut batch = zone_batch(2);
        batch.zones.remove(&ZoneKey::Oh3f);
        assert!(matches!(
            assembler.forward(&batch),
            Err(EffectError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn backward_before_forward_fails() {
        let mut assembler = ZoneAssembler::new(ZoneLayout::default(), 3, 8, 4, 0).unwrap();
        assert!(matches!(
            assembler.backward(&Array3::zeros((1, 5, 4))),
            Err(EffectError::MissingForwardPass { .. })
        ));
    }

    #[test]
    fn gradient_matches_central_differences() {
        let mut assembler = ZoneAssembler::new(ZoneLayout::default(), 3, 6, 4, 3).unwrap();
        let batch = zone_batch(3);
        let weights =
            Array3::from_shape_fn((3, 5, 4), |(n, k, f)| ((n * 7 + k * 3 + f) as f32).cos());

        assembler.forward(&batch).unwrap();
        assembler.backward(&weights).unwrap();
        let analytic = assembler.encoder.mlp.second.grad_weight()[[1, 2]];

        let h = 1e-2f32;
        let original = assembler.encoder.mlp.second.weight[[1, 2]];
        assembler.encoder.mlp.second.weight[[1, 2]] = original + h;
        let plus = (&assembler.forward(&batch).unwrap() * &weights).sum();
        assembler.encoder.mlp.second.weight[[1, 2]] = original - h;
        let minus = (&assembler.forward(&batch).unwrap() * &weights).sum();
        let numeric = (plus - minus) / (2.0 * h);
        assert!((numeric - analytic).abs() < 2e-2, "{} vs {}", numeric, analytic);
    }
}
