//! # First-Order Training
//!
//! Plain Adam over the componentwise networks, used twice: to pretrain the
//! forecasting stack before any sparsity is asked of it, and to re-fit the
//! surviving weights after the support is frozen. No penalty, no proximal
//! step; the group structure is someone else's concern.

use crate::gista::{TraceSample, TrainingTrace};
use crate::layout::ConfigError;
use crate::model::{CMlp, Dense, SeriesMlp};
use crate::objective::Objective;
use ndarray::{Array, ArrayViewMut1, Dimension, Zip};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Hyperparameters for a first-order training phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdamConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub iterations: usize,
    /// Trace sampling interval, in iterations.
    pub check_every: usize,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            iterations: 1000,
            check_every: 100,
        }
    }
}

impl AdamConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.learning_rate <= 0.0 {
            return Err(ConfigError::NonPositiveLearningRate(self.learning_rate));
        }
        if self.check_every == 0 {
            return Err(ConfigError::ZeroCheckInterval);
        }
        Ok(())
    }
}

/// Per-network Adam moments, one pair of tensors per layer.
pub(crate) struct AdamState {
    m: Vec<Dense>,
    v: Vec<Dense>,
}

impl AdamState {
    pub(crate) fn new(net: &SeriesMlp) -> Self {
        let m = net.layers.iter().map(Dense::zeros_like).collect();
        let v = net.layers.iter().map(Dense::zeros_like).collect();
        Self { m, v }
    }

    /// One bias-corrected Adam update over every parameter of `net`.
    /// `t` is the 1-based global step count.
    pub(crate) fn update(
        &mut self,
        net: &mut SeriesMlp,
        grads: &[Dense],
        t: usize,
        cfg: &AdamConfig,
    ) {
        for (idx, layer) in net.layers.iter_mut().enumerate() {
            step_elems(
                &mut layer.weight,
                &grads[idx].weight,
                &mut self.m[idx].weight,
                &mut self.v[idx].weight,
                t,
                cfg,
            );
            step_elems(
                &mut layer.bias,
                &grads[idx].bias,
                &mut self.m[idx].bias,
                &mut self.v[idx].bias,
                t,
                cfg,
            );
        }
    }

    /// Same as `update`, but the first-layer weight matrix is only touched
    /// on the listed columns. Skipped columns keep weight and moments at
    /// zero, so a frozen support stays exactly frozen.
    pub(crate) fn update_restricted(
        &mut self,
        net: &mut SeriesMlp,
        grads: &[Dense],
        first_layer_columns: &[usize],
        t: usize,
        cfg: &AdamConfig,
    ) {
        for &c in first_layer_columns {
            step_column(
                net.layers[0].weight.column_mut(c),
                grads[0].weight.column(c),
                self.m[0].weight.column_mut(c),
                self.v[0].weight.column_mut(c),
                t,
                cfg,
            );
        }
        step_elems(
            &mut net.layers[0].bias,
            &grads[0].bias,
            &mut self.m[0].bias,
            &mut self.v[0].bias,
            t,
            cfg,
        );
        for (idx, layer) in net.layers.iter_mut().enumerate().skip(1) {
            step_elems(
                &mut layer.weight,
                &grads[idx].weight,
                &mut self.m[idx].weight,
                &mut self.v[idx].weight,
                t,
                cfg,
            );
            step_elems(
                &mut layer.bias,
                &grads[idx].bias,
                &mut self.m[idx].bias,
                &mut self.v[idx].bias,
                t,
                cfg,
            );
        }
    }
}

fn step_elems<D: Dimension>(
    param: &mut Array<f64, D>,
    grad: &Array<f64, D>,
    m: &mut Array<f64, D>,
    v: &mut Array<f64, D>,
    t: usize,
    cfg: &AdamConfig,
) {
    let correction1 = 1.0 - cfg.beta1.powi(t as i32);
    let correction2 = 1.0 - cfg.beta2.powi(t as i32);
    Zip::from(param)
        .and(grad)
        .and(m)
        .and(v)
        .for_each(|p, &g, m, v| {
            *m = cfg.beta1 * *m + (1.0 - cfg.beta1) * g;
            *v = cfg.beta2 * *v + (1.0 - cfg.beta2) * g * g;
            let m_hat = *m / correction1;
            let v_hat = *v / correction2;
            *p -= cfg.learning_rate * m_hat / (v_hat.sqrt() + cfg.epsilon);
        });
}

fn step_column(
    mut param: ArrayViewMut1<'_, f64>,
    grad: ndarray::ArrayView1<'_, f64>,
    mut m: ArrayViewMut1<'_, f64>,
    mut v: ArrayViewMut1<'_, f64>,
    t: usize,
    cfg: &AdamConfig,
) {
    let correction1 = 1.0 - cfg.beta1.powi(t as i32);
    let correction2 = 1.0 - cfg.beta2.powi(t as i32);
    Zip::from(&mut param)
        .and(&grad)
        .and(&mut m)
        .and(&mut v)
        .for_each(|p, &g, m, v| {
            *m = cfg.beta1 * *m + (1.0 - cfg.beta1) * g;
            *v = cfg.beta2 * *v + (1.0 - cfg.beta2) * g * g;
            let m_hat = *m / correction1;
            let v_hat = *v / correction2;
            *p -= cfg.learning_rate * m_hat / (v_hat.sqrt() + cfg.epsilon);
        });
}

/// Unregularized pretraining: fits every sub-network to its forecasting task
/// with no penalty of any kind. Mutates the model in place and returns the
/// loss trace.
pub fn pretrain(
    model: &mut CMlp,
    series: ndarray::ArrayView2<'_, f64>,
    cfg: &AdamConfig,
) -> Result<TrainingTrace, ConfigError> {
    cfg.validate()?;
    let objective = Objective::new(series, &model.layout, 0.0)?;
    let num_series = model.config.num_series;
    log::info!(
        "Pretraining {} sub-networks for {} iterations over {} rows",
        num_series,
        cfg.iterations,
        objective.num_rows()
    );

    let mut states: Vec<AdamState> = model.networks.iter().map(AdamState::new).collect();
    let mut trace = TrainingTrace::default();
    for it in 1..=cfg.iterations {
        let total: f64 = model
            .networks
            .par_iter_mut()
            .zip(states.par_iter_mut())
            .enumerate()
            .map(|(i, (net, state))| {
                let (loss, grads) = objective.loss_and_grad(net, i);
                state.update(net, &grads, it, cfg);
                loss
            })
            .sum();
        if it % cfg.check_every == 0 {
            let mse = total / num_series as f64;
            trace.samples.push(TraceSample {
                iteration: it,
                objective: total,
                mse,
            });
            log::debug!("pretrain iteration {it}: mean loss {mse:.6e}");
        }
    }
    Ok(trace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Flattening;
    use crate::model::ModelConfig;
    use ndarray::Array2;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn rejects_bad_learning_rate() {
        let cfg = AdamConfig {
            learning_rate: 0.0,
            ..AdamConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn pretraining_reduces_the_loss() {
        let config = ModelConfig {
            num_series: 2,
            lag: 2,
            hidden: vec![8],
            flattening: Flattening::SeriesMajor,
        };
        let mut model = CMlp::new(config, 2).expect("model");
        let mut rng = StdRng::seed_from_u64(3);
        let series = Array2::from_shape_fn((60, 2), |(t, j)| {
            ((t as f64) * 0.3 + j as f64).sin() + 0.01 * rng.gen_range(-1.0..1.0)
        });

        let objective = Objective::new(series.view(), &model.layout, 0.0).expect("objective");
        let before: f64 = (0..2).map(|i| objective.mse(&model.networks[i], i)).sum();

        let cfg = AdamConfig {
            iterations: 400,
            check_every: 50,
            ..AdamConfig::default()
        };
        let trace = pretrain(&mut model, series.view(), &cfg).expect("pretrain");
        let after: f64 = (0..2).map(|i| objective.mse(&model.networks[i], i)).sum();
        assert!(after < before);
        assert_eq!(trace.samples.len(), 8);
        assert!(trace.samples[0].iteration == 50);
    }
}
