//! # Group Penalties and Proximal Operators
//!
//! Sparsity over first-layer input weights is what turns a stack of
//! forecasting networks into a causality estimator: a candidate series whose
//! entire weight group is exactly zero cannot influence the prediction, so
//! driving groups to zero *is* the structure search. This module computes the
//! penalty value and the exact proximal (shrinkage) step for the two
//! supported penalties. Both proximal maps are closed-form; neither iterates.

use crate::layout::{ConfigError, GroupLayout};
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

/// Which group penalty shapes the first-layer sparsity pattern.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Penalty {
    /// One group per candidate series: either the whole lag window of a
    /// candidate survives, or none of it does.
    GroupLasso,
    /// Chain-nested groups by lag: every lag tail (lags >= k) is penalized as
    /// a unit, so larger lags are always pruned before smaller ones.
    Hierarchical,
}

impl Penalty {
    /// Penalty value at `weights` for strength `lam`.
    pub fn value(
        &self,
        weights: ArrayView2<'_, f64>,
        layout: &GroupLayout,
        lam: f64,
    ) -> Result<f64, ConfigError> {
        if lam < 0.0 {
            return Err(ConfigError::NegativePenalty(lam));
        }
        layout.check_first_layer(weights)?;
        Ok(self.value_inner(weights, layout, lam))
    }

    /// Exact proximal step: in place, shrink `weights` toward the minimizer
    /// of `||w - weights||^2 / (2 * step) + lam * penalty(w)`.
    pub fn prox(
        &self,
        weights: &mut Array2<f64>,
        layout: &GroupLayout,
        lam: f64,
        step: f64,
    ) -> Result<(), ConfigError> {
        if lam < 0.0 {
            return Err(ConfigError::NegativePenalty(lam));
        }
        if step <= 0.0 {
            return Err(ConfigError::NonPositiveStep(step));
        }
        layout.check_first_layer(weights.view())?;
        self.prox_inner(weights, layout, lam, step);
        Ok(())
    }

    /// Validation-free value, for callers that checked the configuration once
    /// before entering a hot loop.
    pub(crate) fn value_inner(
        &self,
        weights: ArrayView2<'_, f64>,
        layout: &GroupLayout,
        lam: f64,
    ) -> f64 {
        let mut total = 0.0;
        for j in 0..layout.num_series() {
            match self {
                Penalty::GroupLasso => total += group_norm(weights, layout, j),
                Penalty::Hierarchical => {
                    for k in 1..=layout.max_lag() {
                        total += suffix_norm(weights, layout, j, k);
                    }
                }
            }
        }
        lam * total
    }

    pub(crate) fn prox_inner(
        &self,
        weights: &mut Array2<f64>,
        layout: &GroupLayout,
        lam: f64,
        step: f64,
    ) {
        let threshold = lam * step;
        match self {
            Penalty::GroupLasso => {
                for j in 0..layout.num_series() {
                    let norm = group_norm(weights.view(), layout, j);
                    scale_columns(weights, layout.group_columns(j), shrink_scale(norm, threshold));
                }
            }
            // The minimizer for chain-nested groups is reached by one
            // soft-threshold per group, deepest tail first: the tail for
            // cutoff L only touches the largest lag, and each later pass
            // re-shrinks everything it nests. A tail that lands on exactly
            // zero stays zero through all later passes, which is what keeps
            // the sparsity pattern monotone in lag.
            Penalty::Hierarchical => {
                for j in 0..layout.num_series() {
                    for k in (1..=layout.max_lag()).rev() {
                        let norm = suffix_norm(weights.view(), layout, j, k);
                        scale_columns(
                            weights,
                            layout.suffix_columns(j, k),
                            shrink_scale(norm, threshold),
                        );
                    }
                }
            }
        }
    }
}

/// Multiplier that soft-thresholds a vector of the given norm. A norm at or
/// below the threshold maps to exactly 0 (ties are pruned), and a zero norm
/// is a fixed point, so reapplication never changes an already-pruned group.
fn shrink_scale(norm: f64, threshold: f64) -> f64 {
    if norm <= threshold {
        0.0
    } else {
        1.0 - threshold / norm
    }
}

fn scale_columns(
    weights: &mut Array2<f64>,
    columns: impl Iterator<Item = usize>,
    scale: f64,
) {
    if scale == 1.0 {
        return;
    }
    for c in columns {
        weights.column_mut(c).mapv_inplace(|w| w * scale);
    }
}

/// Frobenius norm of the full group for candidate `series`, taken across the
/// hidden dimension as well as the lag window.
pub(crate) fn group_norm(weights: ArrayView2<'_, f64>, layout: &GroupLayout, series: usize) -> f64 {
    columns_sq_sum(weights, layout.group_columns(series)).sqrt()
}

/// Frobenius norm of the lag tail (lags >= `lag_cutoff`) for `series`.
pub(crate) fn suffix_norm(
    weights: ArrayView2<'_, f64>,
    layout: &GroupLayout,
    series: usize,
    lag_cutoff: usize,
) -> f64 {
    columns_sq_sum(weights, layout.suffix_columns(series, lag_cutoff)).sqrt()
}

fn columns_sq_sum(weights: ArrayView2<'_, f64>, columns: impl Iterator<Item = usize>) -> f64 {
    columns
        .map(|c| weights.column(c).iter().map(|w| w * w).sum::<f64>())
        .sum()
}
