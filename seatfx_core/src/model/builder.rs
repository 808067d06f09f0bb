//! Construction of the configured architecture.

use ndarray::Array2;

use super::{CausalNet, CovariateStage, EffectModel, ZoneAssembler, ZoneLayout};
use crate::config::{Architecture, ExperimentConfig};
use crate::error::{EffectError, EffectResult};
use crate::nn::{fully_connected, ConcatHead, GraphHead};

/// Data-dependent sizes a model is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelDims {
    pub din: usize,
    pub dtreat: usize,
    pub dout: usize,
    /// Channels of every zone block
    pub channels: usize,
}

/// Builds the model named by `config.model`.
///
/// `adjacency` is only used by [`Architecture::ZoneGcn`] and must cover the
/// representation nodes plus one vertex per treatment component; a fully
/// connected graph is used when it is `None`.
pub fn build_model(
    config: &ExperimentConfig,
    dims: &ModelDims,
    layout: ZoneLayout,
    adjacency: Option<&Array2<f32>>,
) -> EffectResult<Box<dyn EffectModel>> {
    let seed = config.seed;
    let model: Box<dyn EffectModel> = match config.model {
        Architecture::Tarnet | Architecture::TarnetMost => Box::new(CausalNet::new(
            config.model.name(),
            Box::new(CovariateStage::new(
                dims.din,
                config.hidden_rep,
                config.out_rep,
                seed,
            )),
            Box::new(ConcatHead::new(
                1,
                config.out_rep,
                dims.dtreat,
                config.hidden_gcn,
                dims.dout,
                seed.wrapping_add(100),
            )),
        )),
        Architecture::ZoneMlp => {
            let nodes = layout.nodes();
            Box::new(CausalNet::new(
                config.model.name(),
                Box::new(ZoneAssembler::new(
                    layout,
                    dims.channels,
                    config.hidden_rep,
                    config.out_rep,
                    seed,
                )?),
                Box::new(ConcatHead::new(
                    nodes,
                    config.out_rep,
                    dims.dtreat,
                    config.hidden_gcn,
                    dims.dout,
                    seed.wrapping_add(100),
                )),
            ))
        }
        Architecture::ZoneGcn => {
            let vertices = layout.nodes() + dims.dtreat;
            let adjacency = match adjacency {
                Some(a) if a.dim() == (vertices, vertices) => a.clone(),
                Some(a) => {
                    return Err(EffectError::shape_mismatch(
                        (vertices, vertices),
                        a.dim(),
                        "graph adjacency",
                    ))
                }
                None => fully_connected(vertices),
            };
            Box::new(CausalNet::new(
                config.model.name(),
                Box::new(ZoneAssembler::new(
                    layout,
                    dims.channels,
                    config.hidden_rep,
                    config.out_rep,
                    seed,
                )?),
                Box::new(GraphHead::new(
                    &adjacency,
                    config.out_rep,
                    config.hidden_gcn,
                    dims.dout,
                    seed.wrapping_add(100),
                )),
            ))
        }
    };
    Ok(model)
}
