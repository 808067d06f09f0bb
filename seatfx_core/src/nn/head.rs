//! Output heads that fuse a representation with the treatment.

use ndarray::{s, Array2, Array3, Axis};

use super::linear::Linear;
use super::mlp::{relu, relu_derivative, reshape_error, Mlp, MlpTrace};
use super::param::{scoped, ParamMut, Parameterized};
use crate::error::{EffectError, EffectResult};

/// Maps `(representation [N, nodes, F], treatment [N, dtreat])` to `[N, dout]`.
///
/// Heads cache what they need between `forward` and `backward`; `backward`
/// returns the gradient for the representation only.
pub trait OutputHead: Send {
    fn forward(
        &mut self,
        representation: &Array3<f32>,
        treatment: &Array2<f32>,
    ) -> EffectResult<Array2<f32>>;

    fn backward(&mut self, grad_output: &Array2<f32>) -> EffectResult<Array3<f32>>;

    fn params_mut(&mut self, prefix: &str) -> Vec<ParamMut<'_>>;
}

fn check_rows(representation: &Array3<f32>, treatment: &Array2<f32>) -> EffectResult<()> {
    if representation.len_of(Axis(0)) != treatment.nrows() {
        return Err(EffectError::shape_mismatch(
            representation.len_of(Axis(0)),
            treatment.nrows(),
            "head inputs",
        ));
    }
    Ok(())
}

/// Flattened representation concatenated with the raw treatment, then an MLP.
#[derive(Debug, Clone)]
pub struct ConcatHead {
    mlp: Mlp,
    trace: Option<(MlpTrace, (usize, usize, usize))>,
}

impl ConcatHead {
    pub fn new(
        nodes: usize,
        features: usize,
        dtreat: usize,
        hidden: usize,
        dout: usize,
        seed: u64,
    ) -> Self {
        Self {
            mlp: Mlp::new(nodes * features + dtreat, hidden, dout, seed),
            trace: None,
        }
    }
}

impl OutputHead for ConcatHead {
    fn forward(
        &mut self,
        representation: &Array3<f32>,
        treatment: &Array2<f32>,
    ) -> EffectResult<Array2<f32>> {
        check_rows(representation, treatment)?;
        let dim = representation.dim();
        let flat = representation
            .as_standard_layout()
            .into_owned()
            .into_shape((dim.0, dim.1 * dim.2))
            .map_err(|err| reshape_error(err, "concat head input"))?;
        let input = ndarray::concatenate(Axis(1), &[flat.view(), treatment.view()])
            .map_err(|err| reshape_error(err, "concat head fusion"))?;
        let (output, trace) = self.mlp.forward(&input)?;
        self.trace = Some((trace, dim));
        Ok(output)
    }

    fn backward(&mut self, grad_output: &Array2<f32>) -> EffectResult<Array3<f32>> {
        let (trace, dim) = self
            .trace
            .take()
            .ok_or_else(|| EffectError::missing_forward("concat head"))?;
        let grad_input = self.mlp.backward(&trace, grad_output);
        let width = dim.1 * dim.2;
        grad_input
            .slice(s![.., ..width])
            .to_owned()
            .into_shape(dim)
            .map_err(|err| reshape_error(err, "concat head gradient"))
    }

    fn params_mut(&mut self, prefix: &str) -> Vec<ParamMut<'_>> {
        self.mlp.params_mut(prefix)
    }
}

/// Fully connected adjacency with self loops over `nodes` vertices.
pub fn fully_connected(nodes: usize) -> Array2<f32> {
    Array2::ones((nodes, nodes))
}

/// Symmetric normalization `D^-½ (A + I) D^-½`.
pub fn normalize_adjacency(adjacency: &Array2<f32>) -> Array2<f32> {
    let n = adjacency.nrows();
    let mut with_loops = adjacency.clone();
    for i in 0..n {
        with_loops[[i, i]] = 1.0;
    }
    let degree = with_loops.sum_axis(Axis(1));
    let inv_sqrt = degree.mapv(|d| if d > 0.0 { 1.0 / d.sqrt() } else { 0.0 });
    Array2::from_shape_fn((n, n), |(i, j)| inv_sqrt[i] * with_loops[[i, j]] * inv_sqrt[j])
}

#[derive(Debug, Clone)]
struct GraphTrace {
    propagated: Array2<f32>,
    hidden_pre: Array2<f32>,
    hidden_flat: Array2<f32>,
    dim: (usize, usize, usize),
}

/// One graph convolution over representation nodes plus treatment nodes,
/// followed by a linear readout of the flattened node states.
///
/// Each treatment component becomes an extra node whose feature vector is the
/// component value repeated along the feature axis.
#[derive(Debug, Clone)]
pub struct GraphHead {
    adjacency: Array2<f32>,
    conv: Linear,
    readout: Linear,
    trace: Option<GraphTrace>,
}

impl GraphHead {
    /// `adjacency` covers `nodes + dtreat` vertices; self loops are added here.
    pub fn new(
        adjacency: &Array2<f32>,
        features: usize,
        hidden: usize,
        dout: usize,
        seed: u64,
    ) -> Self {
        let vertices = adjacency.nrows();
        Self {
            adjacency: normalize_adjacency(adjacency),
            conv: Linear::new(features, hidden, seed),
            readout: Linear::new(vertices * hidden, dout, seed.wrapping_add(1)),
            trace: None,
        }
    }

    fn vertices(&self) -> usize {
        self.adjacency.nrows()
    }
}

impl OutputHead for GraphHead {
    fn forward(
        &mut self,
        representation: &Array3<f32>,
        treatment: &Array2<f32>,
    ) -> EffectResult<Array2<f32>> {
        check_rows(representation, treatment)?;
        let (samples, nodes, features) = representation.dim();
        let vertices = nodes + treatment.ncols();
        if vertices != self.vertices() {
            return Err(EffectError::shape_mismatch(
                self.vertices(),
                vertices,
                "graph head vertices (nodes + treatment)",
            ));
        }

        let mut graph = Array3::zeros((samples, vertices, features));
        graph.slice_mut(s![.., ..nodes, ..]).assign(representation);
        for (mut sample, t) in graph.outer_iter_mut().zip(treatment.outer_iter()) {
            for (k, &value) in t.iter().enumerate() {
                sample.row_mut(nodes + k).fill(value);
            }
        }

        let mut propagated = Array3::zeros(graph.raw_dim());
        for (mut out, x) in propagated.outer_iter_mut().zip(graph.outer_iter()) {
            out.assign(&self.adjacency.dot(&x));
        }
        let propagated = propagated
            .into_shape((samples * vertices, features))
            .map_err(|err| reshape_error(err, "graph propagation"))?;

        let hidden_pre = self.conv.forward(&propagated)?;
        let hidden_width = hidden_pre.ncols();
        let hidden_flat = relu(&hidden_pre)
            .into_shape((samples, vertices * hidden_width))
            .map_err(|err| reshape_error(err, "graph readout input"))?;
        let output = self.readout.forward(&hidden_flat)?;

        self.trace = Some(GraphTrace {
            propagated,
            hidden_pre,
            hidden_flat,
            dim: (samples, nodes, features),
        });
        Ok(output)
    }

    fn backward(&mut self, grad_output: &Array2<f32>) -> EffectResult<Array3<f32>> {
        let trace = self
            .trace
            .take()
            .ok_or_else(|| EffectError::missing_forward("graph head"))?;
        let (samples, nodes, features) = trace.dim;
        let vertices = self.vertices();

        let grad_hidden_flat = self.readout.backward(&trace.hidden_flat, grad_output);
        let grad_hidden = grad_hidden_flat
            .into_shape(trace.hidden_pre.raw_dim())
            .map_err(|err| reshape_error(err, "graph readout gradient"))?;
        let grad_pre = grad_hidden * relu_derivative(&trace.hidden_pre);
        let grad_propagated = self
            .conv
            .backward(&trace.propagated, &grad_pre)
            .into_shape((samples, vertices, features))
            .map_err(|err| reshape_error(err, "graph conv gradient"))?;

        let adjacency_t = self.adjacency.t();
        let mut grad_rep = Array3::zeros((samples, nodes, features));
        for (mut out, g) in grad_rep.outer_iter_mut().zip(grad_propagated.outer_iter()) {
            let grad_graph = adjacency_t.dot(&g);
            out.assign(&grad_graph.slice(s![..nodes, ..]));
        }
        Ok(grad_rep)
    }

    fn params_mut(&mut self, prefix: &str) -> Vec<ParamMut<'_>> {
        let mut params = self.conv.params_mut(&scoped(prefix, "conv"));
        params.extend(self.readout.params_mut(&scoped(prefix, "readout")));
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn normalized_adjacency_rows_of_full_graph() {
        let a_hat = normalize_adjacency(&fully_connected(4));
        for value in a_hat.iter() {
            assert!((value - 0.25).abs() < 1e-6);
        }
    }

    #[test]
    fn normalization_adds_self_loops() {
        let a_hat = normalize_adjacency(&Array2::zeros((3, 3)));
        assert_eq!(a_hat, Array2::<f32>::eye(3));
    }

    #[test]
    fn concat_head_backward_requires_forward() {
        let mut head = ConcatHead::new(2, 3, 2, 4, 1, 0);
        assert!(matches!(
            head.backward(&Array2::zeros((1, 1))),
            Err(EffectError::MissingForwardPass { .. })
        ));
    }

    #[test]
    fn graph_head_rejects_wrong_vertex_count() {
        let mut head = GraphHead::new(&fully_connected(4), 3, 5, 2, 0);
        let rep = Array3::zeros((2, 2, 3));
        let treatment = array![[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
        assert!(matches!(
            head.forward(&rep, &treatment),
            Err(EffectError::ShapeMismatch { .. })
        ));
    }

    fn check_head_gradient(head: &mut dyn OutputHead, rep: &Array3<f32>, treatment: &Array2<f32>) {
        let out = head.forward(rep, treatment).unwrap();
        let grad = head.backward(&Array2::ones(out.raw_dim())).unwrap();

        let h = 1e-3f32;
        for index in [[0, 0, 0], [1, 1, 2]] {
            let mut plus = rep.clone();
            plus[index] += h;
            let mut minus = rep.clone();
            minus[index] -= h;
            let numeric = (head.forward(&plus, treatment).unwrap().sum()
                - head.forward(&minus, treatment).unwrap().sum())
                / (2.0 * h);
            assert!(
                (numeric - grad[index]).abs() < 1e-2,
                "{:?}: {} vs {}",
                index,
                numeric,
                grad[index]
            );
        }
    }

    #[test]
    fn head_gradients_match_central_differences() {
        let mut rng = StdRng::seed_from_u64(21);
        let rep = Array3::from_shape_fn((2, 2, 3), |_| rng.gen_range(-1.0..1.0));
        let treatment = array![[1.0, 0.0], [0.0, 1.0]];

        let mut concat = ConcatHead::new(2, 3, 2, 6, 2, 5);
        check_head_gradient(&mut concat, &rep, &treatment);

        let mut graph = GraphHead::new(&fully_connected(4), 3, 6, 2, 5);
        check_head_gradient(&mut graph, &rep, &treatment);
    }
}
