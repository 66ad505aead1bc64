//! # Smooth Objective
//!
//! One-step-ahead mean squared error plus an optional ridge term on every
//! layer past the first. The ridge is part of the smooth objective (value
//! and gradient), never of the proximal step; only first-layer weights carry
//! the group penalty. Everything here is deterministic and side-effect free:
//! the lagged design is built once at construction, and every evaluation is
//! a pure function of the network parameters.

use crate::data;
use crate::layout::{ConfigError, GroupLayout};
use crate::model::{relu, Dense, SeriesMlp};
use ndarray::{Array1, Array2, ArrayView2, Axis, Zip};

/// Holds the fixed regression pair for a training run and evaluates the
/// smooth part of the objective for any sub-network.
pub struct Objective {
    inputs: Array2<f64>,
    targets: Array2<f64>,
    lam_ridge: f64,
}

impl Objective {
    pub fn new(
        series: ArrayView2<'_, f64>,
        layout: &GroupLayout,
        lam_ridge: f64,
    ) -> Result<Self, ConfigError> {
        if lam_ridge < 0.0 {
            return Err(ConfigError::NegativeRidge(lam_ridge));
        }
        let (inputs, targets) = data::lagged_design(series, layout)?;
        Ok(Self {
            inputs,
            targets,
            lam_ridge,
        })
    }

    /// Number of regression rows (time indices with a full lag window).
    pub fn num_rows(&self) -> usize {
        self.inputs.nrows()
    }

    /// Mean squared one-step-ahead error of `net` on its target series.
    pub fn mse(&self, net: &SeriesMlp, series: usize) -> f64 {
        let prediction = net.forward_batch(self.inputs.view());
        let residual = &prediction - &self.targets.column(series);
        residual.dot(&residual) / self.inputs.nrows() as f64
    }

    /// MSE plus the ridge term: the part of the objective the gradient step
    /// descends.
    pub fn smooth_loss(&self, net: &SeriesMlp, series: usize) -> f64 {
        self.mse(net, series) + self.ridge_value(net)
    }

    fn ridge_value(&self, net: &SeriesMlp) -> f64 {
        if self.lam_ridge == 0.0 {
            return 0.0;
        }
        let deeper: f64 = net.layers[1..]
            .iter()
            .map(|layer| layer.weight.iter().map(|w| w * w).sum::<f64>())
            .sum();
        self.lam_ridge * deeper
    }

    /// Smooth loss and its gradient with respect to every parameter of
    /// `net`, via reverse-mode accumulation through the dense/ReLU stack.
    pub fn loss_and_grad(&self, net: &SeriesMlp, series: usize) -> (f64, Vec<Dense>) {
        let n_layers = net.layers.len();
        let rows = self.inputs.nrows() as f64;

        // Forward pass, caching pre-activations and post-ReLU activations.
        let mut pre: Vec<Array2<f64>> = Vec::with_capacity(n_layers);
        let mut post: Vec<Array2<f64>> = Vec::with_capacity(n_layers - 1);
        for (idx, layer) in net.layers.iter().enumerate() {
            let below: ArrayView2<'_, f64> = if idx == 0 {
                self.inputs.view()
            } else {
                post[idx - 1].view()
            };
            let z = below.dot(&layer.weight.t()) + &layer.bias;
            if idx < n_layers - 1 {
                post.push(z.mapv(relu));
            }
            pre.push(z);
        }

        let prediction = pre[n_layers - 1].column(0);
        let residual: Array1<f64> = &prediction - &self.targets.column(series);
        let mse = residual.dot(&residual) / rows;
        let loss = mse + self.ridge_value(net);

        // Backward pass.
        let mut delta: Array2<f64> = residual.insert_axis(Axis(1)) * (2.0 / rows);
        let mut grads: Vec<Dense> = Vec::with_capacity(n_layers);
        for idx in (0..n_layers).rev() {
            let below: ArrayView2<'_, f64> = if idx == 0 {
                self.inputs.view()
            } else {
                post[idx - 1].view()
            };
            let mut grad_weight = delta.t().dot(&below);
            if idx > 0 && self.lam_ridge > 0.0 {
                grad_weight.scaled_add(2.0 * self.lam_ridge, &net.layers[idx].weight);
            }
            let grad_bias = delta.sum_axis(Axis(0));
            grads.push(Dense {
                weight: grad_weight,
                bias: grad_bias,
            });
            if idx > 0 {
                delta = delta.dot(&net.layers[idx].weight);
                Zip::from(&mut delta).and(&pre[idx - 1]).for_each(|d, &z| {
                    if z <= 0.0 {
                        *d = 0.0;
                    }
                });
            }
        }
        grads.reverse();
        (loss, grads)
    }
}
