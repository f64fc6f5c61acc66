//! # Recurrent Hybrid Layers
//!
//! [`OdeRnn`] processes irregularly sampled sequences by alternating two
//! kinds of update on a hidden state:
//!
//! - an ODE segment over `[0, 1]`, with the derivative scaled by the
//!   observation's time stamp (so the segment effectively spans the gap
//!   between observations);
//! - a discrete [`RecurrentUpdate`] that folds in the observation.
//!
//! ## Modes
//!
//! | `rnn_out` | Order per step `i` | Emitted sequence |
//! |-----------|--------------------|------------------|
//! | `false` (default) | `h_rnn[i] = rnn(h_ode[i])`, `h_ode[i+1] = ode(h_rnn[i])` | `h_ode` |
//! | `true` | `h_ode[i] = ode(h_rnn[i])`, `h_rnn[i+1] = rnn(h_ode[i])` | `h_rnn` |
//!
//! With `both` set the layer emits `[h_rnn, h_ode]`. Every sequence has
//! `steps + 1` states; an entry that a mode never writes stays zero.
//!
//! ## Forecasting
//!
//! Passing forecast times integrates the last emitted state with a unit time
//! scale and returns the states at those times.
//!
//! ## Gradient Probes
//!
//! [`OdeRnn::forward_retaining`] adds a zero-valued autodiff leaf to every
//! differentiable hidden state. After `backward()` the leaf's gradient is the
//! hidden state's gradient, available through [`GradProbes`].

mod ode_rnn;

pub use ode_rnn::{
    GradProbes, InitialCondition, OdeRnn, OdeRnnConfig, RecurrentUpdate, RnnOutput,
};
