//! # GISTA Training Loop
//!
//! Generalized iterative shrinkage-thresholding over the componentwise
//! networks: a gradient step on the smooth forecasting objective, an exact
//! group proximal step on first-layer weights, and a backtracking line
//! search that only ever accepts a sufficient decrease. Each sub-network is
//! an independent optimization problem, so step sizes, convergence, and
//! failure are all tracked per series; one diverging series never stalls or
//! corrupts the others.

use crate::layout::{ConfigError, GroupLayout};
use crate::model::{CMlp, Dense, SeriesMlp};
use crate::objective::Objective;
use crate::penalty::Penalty;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Hyperparameters for one GISTA run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GistaConfig {
    /// Group-sparsity strength.
    pub lam: f64,
    /// Ridge strength on non-first-layer weights.
    pub lam_ridge: f64,
    /// Initial per-series step size.
    pub step_size: f64,
    pub penalty: Penalty,
    pub max_iterations: usize,
    /// Convergence-check and trace-sampling interval, in iterations.
    pub check_every: usize,
    /// Relative objective-change tolerance at a check.
    pub tolerance: f64,
    /// Multiplicative step shrink on a rejected line-search attempt.
    pub step_shrink: f64,
    /// Multiplicative step growth after an accepted iteration.
    pub step_growth: f64,
    /// Line-search attempts per iteration before the series is declared
    /// non-convergent.
    pub max_line_search: usize,
}

impl Default for GistaConfig {
    fn default() -> Self {
        Self {
            lam: 0.1,
            lam_ridge: 0.01,
            step_size: 0.1,
            penalty: Penalty::Hierarchical,
            max_iterations: 5000,
            check_every: 100,
            tolerance: 1e-4,
            step_shrink: 0.5,
            step_growth: 1.25,
            max_line_search: 30,
        }
    }
}

impl GistaConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lam < 0.0 {
            return Err(ConfigError::NegativePenalty(self.lam));
        }
        if self.lam_ridge < 0.0 {
            return Err(ConfigError::NegativeRidge(self.lam_ridge));
        }
        if self.step_size <= 0.0 {
            return Err(ConfigError::NonPositiveStep(self.step_size));
        }
        if !(self.step_shrink > 0.0 && self.step_shrink < 1.0) {
            return Err(ConfigError::BadShrinkFactor(self.step_shrink));
        }
        if self.step_growth < 1.0 {
            return Err(ConfigError::BadGrowthFactor(self.step_growth));
        }
        if self.check_every == 0 {
            return Err(ConfigError::ZeroCheckInterval);
        }
        if self.tolerance < 0.0 {
            return Err(ConfigError::NegativeTolerance(self.tolerance));
        }
        if self.max_line_search == 0 {
            return Err(ConfigError::NoLineSearchBudget);
        }
        Ok(())
    }
}

/// Terminal state of a run that did not diverge.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FitStatus {
    /// Every sub-network's objective change fell below tolerance.
    Converged,
    /// The iteration budget ran out first. Not an error; the weights are
    /// whatever the last accepted iteration left behind.
    MaxIterationsReached,
}

/// One trace sample: total objective across sub-networks and their mean
/// forecasting error.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TraceSample {
    pub iteration: usize,
    pub objective: f64,
    pub mse: f64,
}

/// Append-only log of objective samples at the check interval.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingTrace {
    pub samples: Vec<TraceSample>,
}

/// Why a sub-network was dropped from the run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DivergenceReason {
    /// The line search exhausted its shrink budget without a sufficient
    /// decrease.
    LineSearchExhausted,
    /// The smooth objective stopped being finite.
    NonFiniteLoss,
}

/// Post-mortem for one diverged sub-network. The series' weights stay at
/// their last accepted state.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SeriesFailure {
    pub series: usize,
    pub iteration: usize,
    pub last_objective: f64,
    pub reason: DivergenceReason,
}

#[derive(Error, Debug)]
pub enum TrainError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// At least one sub-network diverged. The trace collected up to the
    /// halt is carried here, never discarded.
    #[error("{} of {total} sub-networks diverged during proximal-gradient training", .failures.len())]
    Diverged {
        failures: Vec<SeriesFailure>,
        trace: TrainingTrace,
        total: usize,
    },
}

/// What a completed (non-diverged) run reports.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GistaSummary {
    pub status: FitStatus,
    /// Iterations actually executed.
    pub iterations: usize,
    pub trace: TrainingTrace,
    /// Final per-series step sizes.
    pub step_sizes: Vec<f64>,
}

/// Per-series optimizer state. Kept in an explicit vector owned by the run,
/// so concurrent runs on different models can never observe each other.
struct SeriesState {
    step: f64,
    /// Total objective (smooth + penalty) after the last accepted step.
    objective: f64,
    /// Objective at the previous convergence check.
    checked_objective: f64,
    active: bool,
    converged: bool,
    failure: Option<SeriesFailure>,
}

/// Runs GISTA in place on `model`. Returns the summary, or a divergence
/// report carrying the partial trace once the loop has halted. An optional
/// `stop` flag is polled at iteration boundaries only; the weights are left
/// at the last accepted state.
pub fn train_gista(
    model: &mut CMlp,
    series: ndarray::ArrayView2<'_, f64>,
    cfg: &GistaConfig,
    stop: Option<&AtomicBool>,
) -> Result<GistaSummary, TrainError> {
    cfg.validate()?;
    let objective = Objective::new(series, &model.layout, cfg.lam_ridge)?;
    let layout = model.layout;
    let num_series = model.config.num_series;
    for net in &model.networks {
        layout.check_first_layer(net.first_layer().view())?;
    }
    log::info!(
        "Starting GISTA: {} sub-networks, lam {:.3e}, {:?} penalty, {} max iterations",
        num_series,
        cfg.lam,
        cfg.penalty,
        cfg.max_iterations
    );

    let mut states: Vec<SeriesState> = model
        .networks
        .iter()
        .enumerate()
        .map(|(i, net)| {
            let total = objective.smooth_loss(net, i)
                + cfg.penalty.value_inner(net.first_layer().view(), &layout, cfg.lam);
            SeriesState {
                step: cfg.step_size,
                objective: total,
                checked_objective: total,
                active: true,
                converged: false,
                failure: None,
            }
        })
        .collect();

    let mut trace = TrainingTrace::default();
    let mut iterations = 0;
    for it in 1..=cfg.max_iterations {
        if stop.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
            log::info!("Stop signal observed at iteration {it}; halting with last accepted weights");
            break;
        }
        iterations = it;

        model
            .networks
            .par_iter_mut()
            .zip(states.par_iter_mut())
            .enumerate()
            .for_each(|(i, (net, state))| {
                if state.active {
                    series_step(net, state, &objective, &layout, cfg, i, it);
                }
            });

        if it % cfg.check_every == 0 {
            let total: f64 = states.iter().map(|s| s.objective).sum();
            let mean_mse: f64 = model
                .networks
                .iter()
                .enumerate()
                .map(|(i, net)| objective.mse(net, i))
                .sum::<f64>()
                / num_series as f64;
            trace.samples.push(TraceSample {
                iteration: it,
                objective: total,
                mse: mean_mse,
            });
            log::debug!("GISTA iteration {it}: objective {total:.6e}, mean MSE {mean_mse:.6e}");

            for state in states.iter_mut().filter(|s| s.active) {
                let scale = state.checked_objective.abs().max(1e-12);
                if (state.checked_objective - state.objective).abs() / scale < cfg.tolerance {
                    state.converged = true;
                    state.active = false;
                }
                state.checked_objective = state.objective;
            }
        }

        if states.iter().all(|s| !s.active) {
            break;
        }
    }

    let failures: Vec<SeriesFailure> = states.iter().filter_map(|s| s.failure).collect();
    if !failures.is_empty() {
        for f in &failures {
            log::warn!(
                "sub-network {} diverged at iteration {} ({:?}), last objective {:.6e}",
                f.series,
                f.iteration,
                f.reason,
                f.last_objective
            );
        }
        return Err(TrainError::Diverged {
            failures,
            trace,
            total: num_series,
        });
    }

    let status = if states.iter().all(|s| s.converged) {
        FitStatus::Converged
    } else {
        FitStatus::MaxIterationsReached
    };
    log::info!("GISTA finished after {iterations} iterations: {status:?}");
    Ok(GistaSummary {
        status,
        iterations,
        trace,
        step_sizes: states.iter().map(|s| s.step).collect(),
    })
}

/// One proximal-gradient iteration for a single sub-network, including the
/// backtracking line search.
fn series_step(
    net: &mut SeriesMlp,
    state: &mut SeriesState,
    objective: &Objective,
    layout: &GroupLayout,
    cfg: &GistaConfig,
    series: usize,
    iteration: usize,
) {
    let (smooth, grads) = objective.loss_and_grad(net, series);
    if !smooth.is_finite() {
        state.active = false;
        state.failure = Some(SeriesFailure {
            series,
            iteration,
            last_objective: state.objective,
            reason: DivergenceReason::NonFiniteLoss,
        });
        return;
    }

    let mut step = state.step;
    for _ in 0..cfg.max_line_search {
        let mut candidate = net.clone();
        for (layer, grad) in candidate.layers.iter_mut().zip(&grads) {
            layer.weight.scaled_add(-step, &grad.weight);
            layer.bias.scaled_add(-step, &grad.bias);
        }
        cfg.penalty
            .prox_inner(candidate.first_layer_mut(), layout, cfg.lam, step);

        // Sufficient decrease against the quadratic model at the current
        // point: smooth(z) <= smooth(w) + <grad, z - w> + |z - w|^2 / (2 step).
        // The group penalty appears on both sides and cancels.
        let candidate_smooth = objective.smooth_loss(&candidate, series);
        let (descent, sq_dist) = displacement_terms(net, &candidate, &grads);
        let bound = smooth + descent + sq_dist / (2.0 * step);
        let slack = 1e-12 * smooth.abs().max(1.0);
        if candidate_smooth.is_finite() && candidate_smooth <= bound + slack {
            let penalty_value =
                cfg.penalty
                    .value_inner(candidate.first_layer().view(), layout, cfg.lam);
            *net = candidate;
            state.objective = candidate_smooth + penalty_value;
            state.step = step * cfg.step_growth;
            return;
        }
        step *= cfg.step_shrink;
    }

    state.active = false;
    state.failure = Some(SeriesFailure {
        series,
        iteration,
        last_objective: state.objective,
        reason: DivergenceReason::LineSearchExhausted,
    });
}

/// Gradient-displacement inner product and squared displacement norm over
/// every parameter tensor of the pair.
fn displacement_terms(current: &SeriesMlp, candidate: &SeriesMlp, grads: &[Dense]) -> (f64, f64) {
    let mut descent = 0.0;
    let mut sq_dist = 0.0;
    for ((cur, cand), grad) in current.layers.iter().zip(&candidate.layers).zip(grads) {
        for ((&w0, &w1), &g) in cur
            .weight
            .iter()
            .zip(cand.weight.iter())
            .zip(grad.weight.iter())
        {
            let d = w1 - w0;
            descent += g * d;
            sq_dist += d * d;
        }
        for ((&b0, &b1), &g) in cur.bias.iter().zip(cand.bias.iter()).zip(grad.bias.iter()) {
            let d = b1 - b0;
            descent += g * d;
            sq_dist += d * d;
        }
    }
    (descent, sq_dist)
}
