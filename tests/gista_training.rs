use ndarray::Array2;
use skein::data::{simulate_var, VarSpec};
use skein::extract;
use skein::gista::{train_gista, DivergenceReason, FitStatus, GistaConfig, TrainError};
use skein::layout::Flattening;
use skein::model::{CMlp, ModelConfig};
use skein::penalty::Penalty;

fn model(num_series: usize, lag: usize, seed: u64) -> CMlp {
    let config = ModelConfig {
        num_series,
        lag,
        hidden: vec![8],
        flattening: Flattening::SeriesMajor,
    };
    CMlp::new(config, seed).expect("model")
}

fn var_series(num_series: usize, steps: usize, seed: u64) -> Array2<f64> {
    let spec = VarSpec {
        num_series,
        steps,
        ..VarSpec::default()
    };
    simulate_var(&spec, seed).expect("simulate").series
}

#[test]
fn objective_never_increases_across_accepted_iterations() {
    for penalty in [Penalty::GroupLasso, Penalty::Hierarchical] {
        let mut model = model(3, 3, 1);
        let series = var_series(3, 300, 2);
        let cfg = GistaConfig {
            lam: 0.2,
            penalty,
            max_iterations: 120,
            check_every: 1,
            tolerance: 0.0,
            ..GistaConfig::default()
        };
        let summary = train_gista(&mut model, series.view(), &cfg, None).expect("train");
        let objectives: Vec<f64> = summary.trace.samples.iter().map(|s| s.objective).collect();
        assert!(!objectives.is_empty());
        for pair in objectives.windows(2) {
            let slack = 1e-9 * pair[0].abs().max(1.0);
            assert!(
                pair[1] <= pair[0] + slack,
                "objective rose from {} to {}",
                pair[0],
                pair[1]
            );
        }
    }
}

#[test]
fn lag_pattern_stays_monotone_after_every_iteration() {
    // The nesting guarantee is per proximal application, not just at
    // convergence: stop the run after each of the first few iterations and
    // inspect the pattern it left behind.
    for max_iterations in 1..=4 {
        let mut model = model(3, 3, 7);
        let series = var_series(3, 250, 11);
        let cfg = GistaConfig {
            lam: 0.4,
            penalty: Penalty::Hierarchical,
            max_iterations,
            check_every: 1,
            tolerance: 0.0,
            ..GistaConfig::default()
        };
        train_gista(&mut model, series.view(), &cfg, None).expect("train");
        let tensor = extract::lag_causality(&model, 0.0);
        for i in 0..3 {
            for j in 0..3 {
                for k in 1..3 {
                    assert!(
                        tensor[[k - 1, i, j]] as u8 >= tensor[[k, i, j]] as u8,
                        "lag tensor not monotone at ({i}, {j}) after {max_iterations} iterations"
                    );
                }
            }
        }
    }
}

#[test]
fn all_zero_weights_on_zero_data_are_a_fixed_point() {
    let mut model = model(3, 2, 5);
    for net in &mut model.networks {
        for layer in &mut net.layers {
            layer.weight.fill(0.0);
            layer.bias.fill(0.0);
        }
    }
    let series = Array2::zeros((100, 3));
    let cfg = GistaConfig {
        lam: 0.5,
        max_iterations: 200,
        check_every: 10,
        ..GistaConfig::default()
    };
    let summary = train_gista(&mut model, series.view(), &cfg, None).expect("train");
    assert_eq!(summary.status, FitStatus::Converged);
    for net in &model.networks {
        for layer in &net.layers {
            assert!(layer.weight.iter().all(|&w| w == 0.0));
            assert!(layer.bias.iter().all(|&b| b == 0.0));
        }
    }
}

#[test]
fn zero_data_drives_random_first_layers_to_all_zero() {
    let mut model = model(3, 2, 9);
    let series = Array2::zeros((100, 3));
    let cfg = GistaConfig {
        lam: 0.5,
        max_iterations: 2000,
        check_every: 50,
        tolerance: 0.0,
        ..GistaConfig::default()
    };
    train_gista(&mut model, series.view(), &cfg, None).expect("train");
    let matrix = extract::causality_matrix(&model, 0.0);
    assert!(
        matrix.iter().all(|&c| !c),
        "a zero sequence admits no causal structure"
    );
}

#[test]
fn converged_and_budget_exhausted_are_distinguishable() {
    let series = var_series(3, 300, 3);

    let mut lenient = model(3, 3, 4);
    let cfg_lenient = GistaConfig {
        max_iterations: 5000,
        check_every: 10,
        tolerance: 0.5,
        ..GistaConfig::default()
    };
    let summary = train_gista(&mut lenient, series.view(), &cfg_lenient, None).expect("train");
    assert_eq!(summary.status, FitStatus::Converged);
    assert!(summary.iterations < cfg_lenient.max_iterations);

    let mut strict = model(3, 3, 4);
    let cfg_strict = GistaConfig {
        max_iterations: 7,
        check_every: 100,
        tolerance: 0.0,
        ..GistaConfig::default()
    };
    let summary = train_gista(&mut strict, series.view(), &cfg_strict, None).expect("train");
    assert_eq!(summary.status, FitStatus::MaxIterationsReached);
    assert_eq!(summary.iterations, 7);
}

#[test]
fn overflowing_data_reports_divergence_with_partial_state() {
    let mut model = model(2, 1, 6);
    // Finite inputs whose squared residuals overflow: the smooth loss stops
    // being finite on the first evaluation.
    let series = Array2::from_elem((30, 2), 1e200);
    let cfg = GistaConfig {
        max_iterations: 50,
        check_every: 10,
        ..GistaConfig::default()
    };
    match train_gista(&mut model, series.view(), &cfg, None) {
        Err(TrainError::Diverged {
            failures, total, ..
        }) => {
            assert_eq!(total, 2);
            assert_eq!(failures.len(), 2);
            for failure in failures {
                assert_eq!(failure.reason, DivergenceReason::NonFiniteLoss);
                assert_eq!(failure.iteration, 1);
            }
        }
        other => panic!("expected divergence, got {other:?}"),
    }
}

#[test]
fn trace_serializes_for_downstream_tooling() {
    let mut model = model(2, 2, 8);
    let series = var_series(2, 120, 13);
    let cfg = GistaConfig {
        max_iterations: 30,
        check_every: 10,
        tolerance: 0.0,
        ..GistaConfig::default()
    };
    let summary = train_gista(&mut model, series.view(), &cfg, None).expect("train");
    let json = serde_json::to_string(&summary.trace).expect("serialize");
    let parsed: skein::gista::TrainingTrace = serde_json::from_str(&json).expect("parse");
    assert_eq!(parsed, summary.trace);
}
