//! Named mutable access to trainable parameters and their gradients.

use ndarray::ArrayViewMutD;

/// A trainable tensor paired with its accumulated gradient.
///
/// Names are dotted paths (`head.first.weight`) and key optimizer state.
pub struct ParamMut<'a> {
    pub name: String,
    pub value: ArrayViewMutD<'a, f32>,
    pub grad: ArrayViewMutD<'a, f32>,
}

/// Components that own trainable parameters.
pub trait Parameterized {
    /// Every parameter of the component, names prefixed with `prefix`.
    fn params_mut(&mut self, prefix: &str) -> Vec<ParamMut<'_>>;

    fn zero_grad(&mut self) {
        for mut param in self.params_mut("") {
            param.grad.fill(0.0);
        }
    }

    fn num_parameters(&mut self) -> usize {
        self.params_mut("").iter().map(|p| p.value.len()).sum()
    }
}

/// Joins a parent prefix and a child name with a dot.
pub fn scoped(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}
