//! Synthetic evacuation-seating dataset for experiments and tests.
//!
//! Each unit is a seating layout driven by a small latent vector. The latent
//! shapes the zone blocks and the covariate, and sets how fast each treatment
//! evacuates the scene. Outcomes are cumulative evacuation curves, so the
//! noise-free mean is monotone along the time axis.

use std::collections::BTreeMap;

use ndarray::{Array1, Array2, Array3};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::batch::{Batch, ZoneKey};
use super::loader::{InMemoryLoader, LoaderSet};

const LATENT: usize = 3;

/// Configuration for dataset generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyntheticConfig {
    /// Number of seating layouts
    pub units: usize,
    /// Number of one-hot treatments
    pub treatments: usize,
    /// Length of the outcome curve
    pub horizon: usize,
    pub covariate_dim: usize,
    /// Channels of every zone block
    pub channels: usize,
    /// Amplitude of the uniform outcome noise
    pub noise_level: f32,
    /// Fractions of units used for training and validation; the rest is held out
    pub train_fraction: f32,
    pub valid_fraction: f32,
    pub batch_size: usize,
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            units: 120,
            treatments: 4,
            horizon: 10,
            covariate_dim: 6,
            channels: 3,
            noise_level: 0.02,
            train_fraction: 0.6,
            valid_fraction: 0.2,
            batch_size: 16,
            seed: 42,
        }
    }
}

/// Positions of each zone block.
pub fn zone_positions(key: ZoneKey) -> usize {
    match key {
        ZoneKey::Tf => 8,
        ZoneKey::Ph1f => 20,
        ZoneKey::Ph2f => 10,
        ZoneKey::Oh1f | ZoneKey::Oh2f | ZoneKey::Oh3f | ZoneKey::Oh4f => 12,
    }
}

/// One generated layout with its outcomes under every treatment.
#[derive(Debug, Clone)]
pub struct Unit {
    pub covariate: Array1<f32>,
    pub zones: BTreeMap<ZoneKey, Array2<f32>>,
    /// `[treatments, horizon]`
    pub means: Array2<f32>,
    /// `[treatments, horizon]`
    pub outcomes: Array2<f32>,
    /// Treatment observed during training
    pub observed: usize,
}

pub struct SeatingDataset {
    pub units: Vec<Unit>,
    pub config: SyntheticConfig,
}

impl SeatingDataset {
    /// Generate a new synthetic dataset
    pub fn generate(config: SyntheticConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let k = config.treatments.max(1);

        let zone_weights: BTreeMap<ZoneKey, Array2<f32>> = ZoneKey::ALL
            .iter()
            .map(|&key| {
                let w = Array2::from_shape_fn((config.channels, LATENT), |_| {
                    rng.gen_range(-1.0..1.0)
                });
                (key, w)
            })
            .collect();
        let covariate_weights: Array2<f32> =
            Array2::from_shape_fn((config.covariate_dim, LATENT), |_| rng.gen_range(-1.0..1.0));
        let treatment_weights: Array2<f32> =
            Array2::from_shape_fn((k, LATENT), |_| rng.gen_range(-1.0..1.0));
        let treatment_bias = Array1::from_shape_fn(k, |t| 0.5 + t as f32 * 0.4);

        let mut units = Vec::with_capacity(config.units);
        for _ in 0..config.units {
            let latent = Array1::from_shape_fn(LATENT, |_| rng.gen_range(-1.0f32..1.0));

            let mut zones = BTreeMap::new();
            for (&key, weights) in &zone_weights {
                let positions = zone_positions(key);
                let base = weights.dot(&latent);
                let block = Array2::from_shape_fn((positions, config.channels), |(p, c)| {
                    let wave = (p as f32 * 0.7 + c as f32).sin() * 0.1;
                    base[c] + wave + rng.gen_range(-0.05..0.05)
                });
                zones.insert(key, block);
            }

            let covariate = covariate_weights.dot(&latent)
                + Array1::from_shape_fn(config.covariate_dim, |_| rng.gen_range(-0.05..0.05));

            let rates = (treatment_weights.dot(&latent) + &treatment_bias).mapv(softplus);
            let means = Array2::from_shape_fn((k, config.horizon), |(t, step)| {
                let time = (step + 1) as f32 / config.horizon.max(1) as f32;
                1.0 - (-3.0 * rates[t] * time).exp()
            });
            let outcomes = means.mapv(|m| {
                m + rng.gen::<f32>() * config.noise_level * 2.0 - config.noise_level
            });

            // assignment depends on the latent, which confounds the training data
            let preference = (latent[0] + 1.0) / 2.0;
            let observed = if rng.gen::<f32>() < 0.7 {
                ((preference * k as f32) as usize).min(k - 1)
            } else {
                rng.gen_range(0..k)
            };

            units.push(Unit {
                covariate,
                zones,
                means,
                outcomes,
                observed,
            });
        }

        Self { units, config }
    }

    /// `(din, dtreat, dout)`
    pub fn dims(&self) -> (usize, usize, usize) {
        (
            self.config.covariate_dim,
            self.config.treatments.max(1),
            self.config.horizon,
        )
    }

    fn one_hot(&self, treatment: usize) -> Array1<f32> {
        let mut v = Array1::zeros(self.config.treatments.max(1));
        v[treatment] = 1.0;
        v
    }

    /// Batch of units, each under its observed treatment.
    fn observed_batch(&self, members: &[usize]) -> Batch {
        let n = members.len();
        let (din, dtreat, dout) = self.dims();
        let mut covariate = Array2::zeros((n, din));
        let mut treatment = Array2::zeros((n, dtreat));
        let mut outcome = Array2::zeros((n, dout));
        let mut mean = Array2::zeros((n, dout));
        let mut zones: BTreeMap<ZoneKey, Array3<f32>> = ZoneKey::ALL
            .iter()
            .map(|&key| {
                (
                    key,
                    Array3::zeros((n, zone_positions(key), self.config.channels)),
                )
            })
            .collect();

        for (row, &index) in members.iter().enumerate() {
            let unit = &self.units[index];
            covariate.row_mut(row).assign(&unit.covariate);
            treatment.row_mut(row).assign(&self.one_hot(unit.observed));
            outcome.row_mut(row).assign(&unit.outcomes.row(unit.observed));
            mean.row_mut(row).assign(&unit.means.row(unit.observed));
            for (key, block) in zones.iter_mut() {
                block
                    .index_axis_mut(ndarray::Axis(0), row)
                    .assign(&unit.zones[key]);
            }
        }

        Batch {
            covariate,
            zones,
            treatment,
            outcome,
            mean,
        }
    }

    /// One unit (a single covariate row) under every treatment.
    fn counterfactual_batch(&self, index: usize) -> Batch {
        let unit = &self.units[index];
        let (din, dtreat, _) = self.dims();
        let covariate = unit
            .covariate
            .clone()
            .into_shape((1, din))
            .unwrap_or_else(|_| Array2::zeros((1, din)));
        let zones = unit
            .zones
            .iter()
            .map(|(&key, block)| (key, block.clone().insert_axis(ndarray::Axis(0))))
            .collect();
        Batch {
            covariate,
            zones,
            treatment: Array2::eye(dtreat),
            outcome: unit.outcomes.clone(),
            mean: unit.means.clone(),
        }
    }

    /// Chunks `members` into batches of at least two samples.
    fn chunked(&self, members: &[usize], batch_size: usize) -> Vec<Batch> {
        let size = batch_size.max(2);
        let mut chunks: Vec<Vec<usize>> = members.chunks(size).map(|c| c.to_vec()).collect();
        if chunks.len() > 1 && chunks.last().map_or(false, |c| c.len() < 2) {
            if let Some(tail) = chunks.pop() {
                if let Some(last) = chunks.last_mut() {
                    last.extend(tail);
                }
            }
        }
        chunks.iter().map(|c| self.observed_batch(c)).collect()
    }

    /// Splits units into train / valid / held-out and builds the four loaders.
    ///
    /// Training units are shuffled once with the dataset seed. `within`
    /// scores training units, `without` the held-out ones.
    pub fn loaders(&self) -> LoaderSet {
        let total = self.units.len();
        let train_end = ((total as f32 * self.config.train_fraction) as usize).min(total);
        let valid_end =
            ((total as f32 * (self.config.train_fraction + self.config.valid_fraction)) as usize)
                .clamp(train_end, total);

        let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(1));
        let mut train: Vec<usize> = (0..train_end).collect();
        train.shuffle(&mut rng);
        let valid: Vec<usize> = (train_end..valid_end).collect();
        let held_out: Vec<usize> = (valid_end..total).collect();

        LoaderSet {
            train: Box::new(InMemoryLoader::new(
                self.chunked(&train, self.config.batch_size),
            )),
            valid: Box::new(InMemoryLoader::new(
                self.chunked(&valid, self.config.batch_size),
            )),
            within: Box::new(InMemoryLoader::new(
                (0..train_end).map(|i| self.counterfactual_batch(i)).collect(),
            )),
            without: Box::new(InMemoryLoader::new(
                held_out.iter().map(|&i| self.counterfactual_batch(i)).collect(),
            )),
        }
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

fn softplus(x: f32) -> f32 {
    if x > 20.0 {
        x
    } else {
        x.exp().ln_1p()
    }
}
