//! Minimal neural-network layers over `ndarray` with hand-written backward passes.

pub mod head;
pub mod layer_norm;
pub mod linear;
pub mod loss;
pub mod mlp;
pub mod optimizer;
pub mod param;

pub use head::{fully_connected, normalize_adjacency, ConcatHead, GraphHead, OutputHead};
pub use layer_norm::LayerNorm;
pub use linear::Linear;
pub use loss::{mse_loss, regression_loss, smooth_max_loss};
pub use mlp::{Mlp, PooledMlp};
pub use optimizer::{clip_grad_norm, Adam, StepLr};
pub use param::{ParamMut, Parameterized};
