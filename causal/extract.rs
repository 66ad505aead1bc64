//! # Causality Extraction
//!
//! The learned structure is read straight off the first-layer weights:
//! series j Granger-causes series i exactly when j's weight group into
//! sub-network i has survived the shrinkage. Everything here is a derived
//! view, recomputed on demand and never cached.

use crate::model::CMlp;
use crate::penalty::{group_norm, suffix_norm};
use itertools::iproduct;
use ndarray::{Array2, Array3};

/// Boolean causality matrix: entry (i, j) is true when candidate series j's
/// group norm into sub-network i strictly exceeds `threshold`. A threshold
/// of zero treats "not exactly zero" as causal; a small positive value adds
/// numerical slack.
pub fn causality_matrix(model: &CMlp, threshold: f64) -> Array2<bool> {
    let p = model.config.num_series;
    Array2::from_shape_fn((p, p), |(i, j)| {
        group_norm(model.networks[i].first_layer().view(), &model.layout, j) > threshold
    })
}

/// Lag-resolved causality tensor, indexed `[lag - 1, target, candidate]`.
/// An entry is true when the candidate still contributes at that lag or any
/// deeper one, i.e. the norm over lags >= k exceeds `threshold` — so for any
/// fixed (target, candidate) pair the tensor is monotone non-increasing
/// along the lag axis.
pub fn lag_causality(model: &CMlp, threshold: f64) -> Array3<bool> {
    let p = model.config.num_series;
    let lag = model.config.lag;
    Array3::from_shape_fn((lag, p, p), |(k, i, j)| {
        suffix_norm(
            model.networks[i].first_layer().view(),
            &model.layout,
            j,
            k + 1,
        ) > threshold
    })
}

/// Fraction of entries two causality matrices agree on. Handy for scoring a
/// recovered structure against a simulator's ground truth.
pub fn agreement(estimate: &Array2<bool>, truth: &Array2<bool>) -> f64 {
    assert_eq!(estimate.dim(), truth.dim());
    let (rows, cols) = estimate.dim();
    let matches = iproduct!(0..rows, 0..cols)
        .filter(|&(i, j)| estimate[[i, j]] == truth[[i, j]])
        .count();
    matches as f64 / (rows * cols) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Flattening;
    use crate::model::{CMlp, ModelConfig};
    use ndarray::array;

    fn model() -> CMlp {
        let config = ModelConfig {
            num_series: 3,
            lag: 2,
            hidden: vec![4],
            flattening: Flattening::SeriesMajor,
        };
        CMlp::new(config, 21).expect("model")
    }

    #[test]
    fn zero_weights_mean_no_causality() {
        let mut model = model();
        for net in &mut model.networks {
            net.first_layer_mut().fill(0.0);
        }
        let matrix = causality_matrix(&model, 0.0);
        assert!(matrix.iter().all(|&c| !c));
        let tensor = lag_causality(&model, 0.0);
        assert!(tensor.iter().all(|&c| !c));
    }

    #[test]
    fn random_initialization_is_fully_dense() {
        let model = model();
        let matrix = causality_matrix(&model, 0.0);
        assert!(matrix.iter().all(|&c| c));
    }

    #[test]
    fn threshold_prunes_weak_groups() {
        let mut model = model();
        for net in &mut model.networks {
            net.first_layer_mut().fill(0.0);
        }
        // One strong group (target 0 <- series 2) and one weak (target 1 <- 0).
        model.networks[0].first_layer_mut()[[0, model.layout.column(2, 1)]] = 1.0;
        model.networks[1].first_layer_mut()[[1, model.layout.column(0, 2)]] = 1e-6;
        let strict = causality_matrix(&model, 0.0);
        assert!(strict[[0, 2]]);
        assert!(strict[[1, 0]]);
        let tolerant = causality_matrix(&model, 1e-3);
        assert!(tolerant[[0, 2]]);
        assert!(!tolerant[[1, 0]]);
    }

    #[test]
    fn lag_tensor_is_monotone_and_tracks_the_deepest_live_lag() {
        let mut model = model();
        for net in &mut model.networks {
            net.first_layer_mut().fill(0.0);
        }
        // Target 0, series 1: live at lag 1 only.
        model.networks[0].first_layer_mut()[[2, model.layout.column(1, 1)]] = 0.4;
        let tensor = lag_causality(&model, 0.0);
        assert!(tensor[[0, 0, 1]]);
        assert!(!tensor[[1, 0, 1]]);
        for (i, j) in iproduct!(0..3, 0..3) {
            assert!(tensor[[0, i, j]] as u8 >= tensor[[1, i, j]] as u8);
        }
    }

    #[test]
    fn agreement_counts_matching_entries() {
        let a = array![[true, false], [false, true]];
        let b = array![[true, true], [false, true]];
        assert_eq!(agreement(&a, &b), 0.75);
        assert_eq!(agreement(&a, &a), 1.0);
    }
}
