//! # Augmented-State ODE Nodes
//!
//! Vector fields built around a learned rate function `df`. The node owns the
//! evaluation counter and the optional per-sample time scale; the solver only
//! sees a [`VectorField`](crate::field::VectorField).
//!
//! ## Variants
//!
//! | Kind | State | Derivative |
//! |------|-------|------------|
//! | [`NodeKind::Plain`] | `x` | `df(t, x)` |
//! | [`NodeKind::SecondOrder`] | `[x, v]` | `[v, df(t, [x, v])]` |
//! | [`NodeKind::HeavyBall`] | `[h, m]` | `[actv(-m), sign·df(t, h) - γ·m + c·h]` |
//!
//! `γ = squash_gamma(gamma)` and `c = squash_nonneg(correction)` are learnable
//! scalars held by [`HeavyBallParams`]. With a non-identity velocity
//! activation the heavy-ball node is the generalized GHBNODE.
//!
//! ## Tensor Shapes
//!
//! The axis after batch is the slot axis for the augmented variants:
//!
//! | Kind | Shape |
//! |------|-------|
//! | Plain | `[batch, *features]` |
//! | SecondOrder | `[batch, slots >= 2, *features]` |
//! | HeavyBall | `[batch, 2, *features]` |

mod heavy_ball;
mod ode_node;

pub use heavy_ball::HeavyBallParams;
pub use ode_node::{NodeKind, OdeNode, OdeNodeConfig};
