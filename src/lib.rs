//! # HBNODE - Heavy Ball Neural ODEs (Rust)
//!
//! Continuous-depth layers for the Burn framework: a learned vector field is
//! wrapped in a node, integrated by an adaptive solver and differentiated
//! either through the solver or with the adjoint method.
//!
//! ## Features
//!
//! - **NODE**: plain neural ODE, `x' = f(t, x)`
//! - **SONODE**: second-order ODE on `[position, velocity]` slots
//! - **ANODE**: zero-augmented state via [`nets::augment_channels`]
//! - **HBNODE / GHBNODE**: heavy-ball momentum with learnable damping and an
//!   optional velocity activation
//! - **Dopri5**: adaptive Dormand–Prince 5(4) with direct and adjoint modes
//! - **ODE-RNN**: hybrid of ODE segments and recurrent updates for
//!   irregularly sampled sequences, with forecasting
//! - **Regularization channel**: residuals such as kinetic energy integrated
//!   alongside the state
//!
//! ## Quick Start
//!
//! ```rust
//! use burn::backend::NdArray;
//! use burn::nn::{Initializer, LinearConfig};
//! use burn::tensor::Tensor;
//! use hbnode::prelude::*;
//!
//! type Backend = NdArray<f32>;
//! let device = Default::default();
//!
//! // h' = -m, m' = df(h) - gamma * m with a zero force field
//! let df = LinearConfig::new(4, 4)
//!     .with_initializer(Initializer::Zeros)
//!     .init::<Backend>(&device);
//! let node = OdeNodeConfig::heavy_ball()
//!     .init::<Backend, _>(df, &device)
//!     .unwrap();
//! let mut layer = NodeLayer::new(IntegratorConfig::new().init(node).unwrap());
//!
//! let x0 = Tensor::<Backend, 3>::zeros([8, 2, 4], &device);
//! let (x1, _) = layer.forward(x0).unwrap();
//! assert_eq!(x1.dims(), [8, 2, 4]);
//! assert!(layer.nfe() > 0);
//! ```
//!
//! ## Layer-level Usage
//!
//! For full trajectories and adjoint gradients use the integrator directly:
//!
//! ```ignore
//! let mut integrator = IntegratorConfig::new()
//!     .with_adjoint(true)
//!     .with_evaluation_times(vec![0.0, 0.5, 1.0])
//!     .init(node)?;
//!
//! let out = integrator.integrate(x0)?;
//! let grads = integrator.adjoint_backward(&out, &trajectory_grads, None)?;
//! ```

pub mod activation;
pub mod error;
pub mod field;
pub mod integrate;
pub mod nets;
pub mod nodes;
pub mod rnn;
pub mod signal;
pub mod solver;

pub mod prelude {
    pub use crate::activation::Squash;
    pub use crate::error::{HbnodeError, Result};
    pub use crate::field::{FieldWrapper, KineticEnergy, NoResidual, Residual, VectorField};
    pub use crate::integrate::{Integration, IntegratorConfig, NodeIntegrator, NodeLayer};
    pub use crate::nets::{
        augment_channels, DenseUpdate, DenseUpdateConfig, InitialVelocity,
        InitialVelocityConfig, MlpFieldConfig, TimeInvariantMlp,
    };
    pub use crate::nodes::{NodeKind, OdeNode, OdeNodeConfig};
    pub use crate::rnn::{
        GradProbes, InitialCondition, OdeRnn, OdeRnnConfig, RecurrentUpdate, RnnOutput,
    };
    pub use crate::signal::SampledSignal;
    pub use crate::solver::{Dopri5, SolveMode, SolverConfig, Trajectory};
}
