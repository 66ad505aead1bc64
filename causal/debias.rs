//! # Debiased Refit
//!
//! Group shrinkage buys exact zeros at the price of biasing every surviving
//! weight toward zero. The cure is a second, penalty-free fit restricted to
//! the discovered support: first-layer columns outside the support are
//! zeroed once and never exposed to the optimizer again, so the refit can
//! only ever move weights the structure search kept.

use crate::gista::{TraceSample, TrainingTrace};
use crate::layout::{ConfigError, GroupLayout};
use crate::model::CMlp;
use crate::objective::Objective;
use crate::opt::{AdamConfig, AdamState};
use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// A frozen first-layer support, derived from a causality matrix. Once
/// built, it never changes; the refit trains through it for its whole life.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupportMask {
    causal: Array2<bool>,
    /// Per target series, the first-layer columns the refit may touch.
    columns: Vec<Vec<usize>>,
}

impl SupportMask {
    /// Expands a p-by-p causality matrix into per-column permissions: every
    /// column of an allowed candidate group is trainable, everything else is
    /// clamped.
    pub fn from_causality(
        layout: &GroupLayout,
        causal: Array2<bool>,
    ) -> Result<Self, ConfigError> {
        let p = layout.num_series();
        if causal.nrows() != p || causal.ncols() != p {
            return Err(ConfigError::MaskShape {
                expected: p,
                rows: causal.nrows(),
                cols: causal.ncols(),
            });
        }
        let columns = (0..p)
            .map(|i| {
                (0..p)
                    .filter(|&j| causal[[i, j]])
                    .flat_map(|j| layout.group_columns(j))
                    .collect()
            })
            .collect();
        Ok(Self { causal, columns })
    }

    pub fn causality(&self) -> &Array2<bool> {
        &self.causal
    }

    fn allowed_columns(&self, target: usize) -> &[usize] {
        &self.columns[target]
    }

    /// Clamps every out-of-support first-layer entry of `model` to zero.
    fn clamp(&self, model: &mut CMlp) {
        let width = model.layout.input_width();
        for (i, net) in model.networks.iter_mut().enumerate() {
            let mut keep = vec![false; width];
            for &c in self.allowed_columns(i) {
                keep[c] = true;
            }
            let first = net.first_layer_mut();
            for (c, &kept) in keep.iter().enumerate() {
                if !kept {
                    first.column_mut(c).fill(0.0);
                }
            }
        }
    }
}

/// A refit model together with the support it is frozen to.
#[derive(Debug, Clone)]
pub struct DebiasedModel {
    pub model: CMlp,
    pub support: SupportMask,
    pub trace: TrainingTrace,
}

/// Re-fits a copy of `model` on `series` with the support held fixed: plain
/// first-order training, no penalty, masked columns pinned at exactly zero.
/// The causal support of the result equals `mask.causality()` entry for
/// entry, whatever the iteration budget (including a budget of zero).
pub fn debias(
    model: &CMlp,
    series: ndarray::ArrayView2<'_, f64>,
    mask: &SupportMask,
    cfg: &AdamConfig,
) -> Result<DebiasedModel, ConfigError> {
    cfg.validate()?;
    if mask.columns.len() != model.config.num_series {
        return Err(ConfigError::MaskShape {
            expected: model.config.num_series,
            rows: mask.columns.len(),
            cols: mask.columns.len(),
        });
    }
    let width = model.layout.input_width();
    if let Some(&column) = mask.columns.iter().flatten().find(|&&c| c >= width) {
        return Err(ConfigError::MaskLayoutMismatch { column, width });
    }
    let objective = Objective::new(series, &model.layout, 0.0)?;

    let mut refit = model.clone();
    mask.clamp(&mut refit);
    log::info!(
        "Debiasing over {} retained edges for {} iterations",
        mask.causal.iter().filter(|&&c| c).count(),
        cfg.iterations
    );

    let mut states: Vec<AdamState> = refit.networks.iter().map(AdamState::new).collect();
    let mut trace = TrainingTrace::default();
    for it in 1..=cfg.iterations {
        let total: f64 = refit
            .networks
            .par_iter_mut()
            .zip(states.par_iter_mut())
            .enumerate()
            .map(|(i, (net, state))| {
                let (loss, grads) = objective.loss_and_grad(net, i);
                state.update_restricted(net, &grads, mask.allowed_columns(i), it, cfg);
                loss
            })
            .sum();
        if it % cfg.check_every == 0 {
            let mse = total / refit.config.num_series as f64;
            trace.samples.push(TraceSample {
                iteration: it,
                objective: total,
                mse,
            });
            log::debug!("debias iteration {it}: mean loss {mse:.6e}");
        }
    }

    Ok(DebiasedModel {
        model: refit,
        support: mask.clone(),
        trace,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract;
    use crate::layout::Flattening;
    use crate::model::ModelConfig;
    use ndarray::{array, Array2};

    fn fixture() -> (CMlp, Array2<f64>) {
        let config = ModelConfig {
            num_series: 3,
            lag: 2,
            hidden: vec![4],
            flattening: Flattening::SeriesMajor,
        };
        let model = CMlp::new(config, 13).expect("model");
        let series = Array2::from_shape_fn((50, 3), |(t, j)| ((t * (j + 1)) as f64 * 0.07).sin());
        (model, series)
    }

    #[test]
    fn mask_rejects_wrong_shapes() {
        let (model, _) = fixture();
        let bad = Array2::from_elem((2, 3), true);
        assert!(SupportMask::from_causality(&model.layout, bad).is_err());
    }

    #[test]
    fn clamped_columns_are_exactly_zero() {
        let (model, series) = fixture();
        let causal = array![
            [true, false, false],
            [false, true, true],
            [true, false, true]
        ];
        let mask = SupportMask::from_causality(&model.layout, causal.clone()).expect("mask");
        let cfg = AdamConfig {
            iterations: 30,
            check_every: 10,
            ..AdamConfig::default()
        };
        let refit = debias(&model, series.view(), &mask, &cfg).expect("debias");
        for i in 0..3 {
            for j in 0..3 {
                for c in model.layout.group_columns(j) {
                    let column = refit.model.networks[i].first_layer().column(c);
                    if causal[[i, j]] {
                        continue;
                    }
                    assert!(column.iter().all(|&w| w == 0.0));
                }
            }
        }
    }

    #[test]
    fn support_is_invariant_for_any_budget() {
        let (model, series) = fixture();
        let causal = array![
            [true, true, false],
            [false, true, false],
            [false, false, true]
        ];
        let mask = SupportMask::from_causality(&model.layout, causal.clone()).expect("mask");
        for iterations in [0, 40] {
            let cfg = AdamConfig {
                iterations,
                check_every: 10,
                ..AdamConfig::default()
            };
            let refit = debias(&model, series.view(), &mask, &cfg).expect("debias");
            let recovered = extract::causality_matrix(&refit.model, 0.0);
            assert_eq!(recovered, causal);
        }
    }
}
