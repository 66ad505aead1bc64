//! Nonlinear Granger causality discovery via componentwise neural networks.
//!
//! One small forecasting network per target series, a hierarchical group
//! penalty over first-layer inputs, and a proximal-gradient trainer that
//! drives irrelevant series (and irrelevant lags) to exact zeros. The
//! surviving weight structure is the estimated causal graph.

#![deny(dead_code)]
#![deny(unused_imports)]

pub mod data;
pub mod debias;
pub mod extract;
pub mod gista;
pub mod layout;
pub mod model;
pub mod objective;
pub mod opt;
pub mod penalty;
