//! Dependence and discrepancy statistics used as representation penalties.

pub mod kernel;
pub mod mmd;

pub use kernel::{gaussian_kernel, hsic, hsic_with_grad};
pub use mmd::{
    balanced_mmd, balanced_mmd_with_grad, mmd_linear, mmd_linear_with_grad, mmd_rbf,
    mmd_rbf_with_grad, partition_by_treatment, CrossTerm, MmdGrad, MmdKernel, MmdSettings,
    Partition, Split,
};
