use skein::data::{simulate_var, VarSpec};
use skein::debias::{debias, SupportMask};
use skein::extract;
use skein::gista::{train_gista, GistaConfig};
use skein::layout::Flattening;
use skein::model::{CMlp, ModelConfig};
use skein::opt::{pretrain, AdamConfig};
use skein::penalty::Penalty;

/// The full pipeline on a small synthetic instance: pretrain, sparsify,
/// read off the structure, refit on the support, forecast. The assertions
/// stick to guarantees of the machinery rather than statistical luck.
#[test]
fn pipeline_end_to_end_on_var_data() {
    let spec = VarSpec {
        num_series: 4,
        lag: 2,
        sparsity: 0.25,
        steps: 600,
        ..VarSpec::default()
    };
    let synthetic = simulate_var(&spec, 31).expect("simulate");
    let series = synthetic.series.view();

    let config = ModelConfig {
        num_series: 4,
        lag: 3,
        hidden: vec![10],
        flattening: Flattening::SeriesMajor,
    };
    let mut model = CMlp::new(config, 31).expect("model");

    let adam = AdamConfig {
        iterations: 300,
        check_every: 50,
        ..AdamConfig::default()
    };
    let pretrain_trace = pretrain(&mut model, series, &adam).expect("pretrain");
    assert_eq!(pretrain_trace.samples.len(), 6);
    let first = pretrain_trace.samples.first().expect("sample");
    let last = pretrain_trace.samples.last().expect("sample");
    assert!(last.objective < first.objective);

    let cfg = GistaConfig {
        lam: 1.0,
        penalty: Penalty::Hierarchical,
        max_iterations: 400,
        check_every: 20,
        tolerance: 1e-5,
        ..GistaConfig::default()
    };
    let summary = train_gista(&mut model, series, &cfg, None).expect("train");
    let objectives: Vec<f64> = summary.trace.samples.iter().map(|s| s.objective).collect();
    for pair in objectives.windows(2) {
        assert!(pair[1] <= pair[0] + 1e-9 * pair[0].abs().max(1.0));
    }

    // A penalty this heavy must actually buy sparsity.
    let causal = extract::causality_matrix(&model, 0.0);
    assert!(causal.iter().any(|&c| !c), "no group was pruned at lam = 1.0");

    let tensor = extract::lag_causality(&model, 0.0);
    for i in 0..4 {
        for j in 0..4 {
            for k in 1..3 {
                assert!(tensor[[k - 1, i, j]] as u8 >= tensor[[k, i, j]] as u8);
            }
        }
    }

    // Debiasing must preserve the discovered support exactly.
    let mask = SupportMask::from_causality(&model.layout, causal.clone()).expect("mask");
    let refit_cfg = AdamConfig {
        iterations: 200,
        check_every: 50,
        ..AdamConfig::default()
    };
    let refit = debias(&model, series, &mask, &refit_cfg).expect("debias");
    assert_eq!(extract::causality_matrix(&refit.model, 0.0), causal);

    // The refit model forecasts from a trailing window.
    let window = synthetic
        .series
        .slice(ndarray::s![synthetic.series.nrows() - 3.., ..]);
    let forecast = refit.model.forecast(window).expect("forecast");
    assert_eq!(forecast.len(), 4);
    assert!(forecast.iter().all(|v| v.is_finite()));
}

/// Strong, dense self-driven dynamics with one clearly irrelevant series:
/// the penalty should at minimum prune the constant-noise series' deepest
/// lags for some target while keeping the sparsity pattern consistent
/// between matrix and tensor views.
#[test]
fn matrix_and_tensor_views_agree() {
    let spec = VarSpec {
        num_series: 3,
        lag: 2,
        sparsity: 0.0,
        steps: 400,
        ..VarSpec::default()
    };
    let synthetic = simulate_var(&spec, 5).expect("simulate");

    let config = ModelConfig {
        num_series: 3,
        lag: 2,
        hidden: vec![8],
        flattening: Flattening::SeriesMajor,
    };
    let mut model = CMlp::new(config, 5).expect("model");
    let cfg = GistaConfig {
        lam: 0.6,
        max_iterations: 300,
        check_every: 25,
        ..GistaConfig::default()
    };
    train_gista(&mut model, synthetic.series.view(), &cfg, None).expect("train");

    let causal = extract::causality_matrix(&model, 0.0);
    let tensor = extract::lag_causality(&model, 0.0);
    for i in 0..3 {
        for j in 0..3 {
            // A group is causal exactly when it is live at lag 1 (the
            // widest tail), and a dead group is dead at every lag.
            assert_eq!(causal[[i, j]], tensor[[0, i, j]]);
            if !causal[[i, j]] {
                assert!(!tensor[[1, i, j]]);
            }
        }
    }
}
