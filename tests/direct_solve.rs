mod common;

use approx::assert_abs_diff_eq;
use common::{
    even_boundaries, max_abs_diff, random_coefficients, solve_dense, split_dense, synthetic,
};
use ndarray::{Array1, Array2, Axis};
use shardfit::collective::CollectiveGroup;
use shardfit::progress::RecordingFitProgress;
use shardfit::{
    Algorithm, ConvergenceController, FitState, FitStatus, FitWarning, RegularizationSpec,
    StoragePrecision, TrainingConfig, fit,
};

fn ridge_config(reg_param: f64, standardization: bool, fit_intercept: bool) -> TrainingConfig {
    TrainingConfig {
        regularization: RegularizationSpec {
            reg_param,
            elastic_net_param: 0.0,
            standardization,
            fit_intercept,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Ridge on the full matrix in the original feature space:
/// `(Xcᵀ W Xc / W + λ D²) β = Xcᵀ W yc / W`, with `D = diag(σ)` when standardizing.
fn reference_ridge(
    x: &Array2<f64>,
    y: &Array1<f64>,
    w: &Array1<f64>,
    reg_param: f64,
    standardization: bool,
    fit_intercept: bool,
) -> (Array1<f64>, f64) {
    let total = w.sum();
    let (x_mean, y_mean) = if fit_intercept {
        let weighted = x * &w.view().insert_axis(Axis(1));
        (weighted.sum_axis(Axis(0)) / total, w.dot(y) / total)
    } else {
        (Array1::zeros(x.ncols()), 0.0)
    };
    let xc = x - &x_mean.view().insert_axis(Axis(0));
    let yc = y - y_mean;
    let xw = &xc * &w.view().insert_axis(Axis(1));
    let mut gram = xw.t().dot(&xc) / total;
    let rhs = xw.t().dot(&yc) / total;

    let full_mean = {
        let weighted = x * &w.view().insert_axis(Axis(1));
        weighted.sum_axis(Axis(0)) / total
    };
    for j in 0..x.ncols() {
        let variance = x
            .column(j)
            .iter()
            .zip(w.iter())
            .map(|(v, wi)| wi * (v - full_mean[j]).powi(2))
            .sum::<f64>()
            / total;
        let penalty = if standardization { variance } else { 1.0 };
        gram[(j, j)] += reg_param * penalty;
    }
    let beta = solve_dense(gram, rhs);
    let intercept = if fit_intercept {
        y_mean - x_mean.dot(&beta)
    } else {
        0.0
    };
    (beta, intercept)
}

#[test]
fn ordinary_least_squares_recovers_known_coefficients() {
    let truth = random_coefficients(20, 11);
    let data = synthetic(1000, &truth, 0.75, 0.1, 12);
    let partitions = split_dense(&data.features, &data.labels, None, &even_boundaries(1000, 4));

    let outcome = fit(partitions, &ridge_config(0.0, true, true)).unwrap();

    assert_eq!(outcome.status, FitStatus::DirectSolved);
    assert_eq!(outcome.summary.algorithm, Algorithm::DirectSolve);
    assert_eq!(outcome.summary.iterations, 1);
    assert_eq!(outcome.model.iterations(), 1);
    assert_eq!(outcome.summary.num_rows, 1000);
    assert_eq!(outcome.summary.num_ranks, 4);
    assert_eq!(outcome.summary.objective_history.len(), 1);
    assert!(outcome.warnings.is_empty());
    assert!(max_abs_diff(outcome.model.coefficients(), &data.coefficients) < 0.02);
    assert_abs_diff_eq!(outcome.model.intercept(), data.intercept, epsilon = 0.02);
    assert_eq!(
        outcome.states,
        vec![
            FitState::Init,
            FitState::BuildStats,
            FitState::Iterate,
            FitState::DirectSolved,
            FitState::Done
        ]
    );
}

#[test]
fn ridge_matches_closed_form_on_unpartitioned_data() {
    let data = synthetic(300, &[1.5, -0.5, 0.0, 2.0, 0.25], -1.0, 0.3, 21);
    let mut scaled = data.features.clone();
    // Different feature scales make standardization observable.
    for (j, factor) in [1.0, 10.0, 0.1, 3.0, 50.0].iter().enumerate() {
        scaled.column_mut(j).mapv_inplace(|v| v * factor + 2.0 * j as f64);
    }
    let weights = Array1::from_shape_fn(300, |i| 0.5 + (i % 3) as f64);

    for &(standardization, fit_intercept) in
        &[(true, true), (false, true), (true, false), (false, false)]
    {
        let (expected, expected_intercept) = reference_ridge(
            &scaled,
            &data.labels,
            &weights,
            0.3,
            standardization,
            fit_intercept,
        );
        for parts in [1, 3] {
            let partitions = split_dense(
                &scaled,
                &data.labels,
                Some(&weights),
                &even_boundaries(300, parts),
            );
            let outcome = fit(
                partitions,
                &ridge_config(0.3, standardization, fit_intercept),
            )
            .unwrap();
            assert!(
                max_abs_diff(outcome.model.coefficients(), &expected) < 1e-8,
                "standardization={standardization} intercept={fit_intercept} parts={parts}: {} vs {expected}",
                outcome.model.coefficients()
            );
            assert_abs_diff_eq!(outcome.model.intercept(), expected_intercept, epsilon = 1e-8);
        }
    }
}

#[test]
fn result_does_not_depend_on_rank_count() {
    let truth = random_coefficients(8, 31);
    let data = synthetic(400, &truth, 2.0, 0.5, 32);
    let config = ridge_config(0.05, true, true);

    let single = fit(
        split_dense(&data.features, &data.labels, None, &[]),
        &config,
    )
    .unwrap();
    for ranks in [2, 8] {
        let outcome = fit(
            split_dense(&data.features, &data.labels, None, &even_boundaries(400, ranks)),
            &config,
        )
        .unwrap();
        assert!(max_abs_diff(outcome.model.coefficients(), single.model.coefficients()) < 1e-10);
        assert_abs_diff_eq!(outcome.model.intercept(), single.model.intercept(), epsilon = 1e-10);
        assert_eq!(outcome.summary.num_ranks, ranks);
    }
}

#[test]
fn skewed_partitions_match_a_single_rank() {
    let data = synthetic(500, &[0.5, 1.0, -1.5], 0.0, 0.2, 41);
    let config = ridge_config(0.1, true, true);
    let single = fit(split_dense(&data.features, &data.labels, None, &[]), &config).unwrap();
    let skewed = fit(
        split_dense(&data.features, &data.labels, None, &[1, 2, 498]),
        &config,
    )
    .unwrap();
    assert!(max_abs_diff(skewed.model.coefficients(), single.model.coefficients()) < 1e-10);
    assert_abs_diff_eq!(skewed.model.intercept(), single.model.intercept(), epsilon = 1e-10);
}

#[test]
fn zero_weight_rows_are_equivalent_to_removed_rows() {
    let data = synthetic(200, &[1.0, -2.0, 0.5, 0.0], 3.0, 0.4, 51);
    let weights = Array1::from_shape_fn(200, |i| if i % 5 == 0 { 0.0 } else { 1.0 });
    let kept: Vec<usize> = (0..200).filter(|i| i % 5 != 0).collect();
    let kept_features = data.features.select(Axis(0), &kept);
    let kept_labels = data.labels.select(Axis(0), &kept);

    let config = ridge_config(0.2, true, true);
    let weighted = fit(
        split_dense(&data.features, &data.labels, Some(&weights), &[70, 140]),
        &config,
    )
    .unwrap();
    let removed = fit(
        split_dense(&kept_features, &kept_labels, None, &[60]),
        &config,
    )
    .unwrap();
    assert!(max_abs_diff(weighted.model.coefficients(), removed.model.coefficients()) < 1e-10);
    assert_abs_diff_eq!(weighted.model.intercept(), removed.model.intercept(), epsilon = 1e-10);
    assert_abs_diff_eq!(weighted.summary.total_weight, 160.0, epsilon = 1e-12);
}

#[test]
fn duplicated_column_falls_back_to_pseudo_inverse() {
    let data = synthetic(300, &[2.0, 0.0, -1.0], 0.5, 0.05, 61);
    let mut features = data.features.clone();
    let first = features.column(0).to_owned();
    features.column_mut(1).assign(&first);
    let labels = &first * 2.0 - &features.column(2) + 0.5;

    let outcome = fit(
        split_dense(&features, &labels, None, &[150]),
        &ridge_config(0.0, true, true),
    )
    .unwrap();

    assert_eq!(outcome.status, FitStatus::DirectSolved);
    assert!(matches!(
        outcome.warnings.as_slice(),
        [FitWarning::IllConditionedSystem { .. }]
    ));
    let beta = outcome.model.coefficients();
    assert!(beta.iter().all(|b| b.is_finite()));
    assert_abs_diff_eq!(beta[0], beta[1], epsilon = 1e-6);
    assert_abs_diff_eq!(beta[0] + beta[1], 2.0, epsilon = 1e-6);
    assert_abs_diff_eq!(beta[2], -1.0, epsilon = 1e-6);
    assert_abs_diff_eq!(outcome.model.intercept(), 0.5, epsilon = 1e-6);
}

#[test]
fn constant_feature_gets_zero_coefficient() {
    let data = synthetic(120, &[1.0, 0.0, -1.0], 0.0, 0.1, 71);
    let mut features = data.features.clone();
    features.column_mut(1).fill(4.0);
    let outcome = fit(
        split_dense(&features, &data.labels, None, &[60]),
        &ridge_config(0.0, true, true),
    )
    .unwrap();
    assert_eq!(outcome.model.coefficients()[1], 0.0);
    assert!(outcome.warnings.is_empty());
    assert_abs_diff_eq!(outcome.model.coefficients()[0], 1.0, epsilon = 0.05);
}

#[test]
fn single_precision_storage_stays_close_to_double() {
    let truth = random_coefficients(10, 81);
    let data = synthetic(600, &truth, 1.0, 0.2, 82);
    let boundaries = even_boundaries(600, 3);
    let mut config = ridge_config(0.01, true, true);
    let double = fit(
        split_dense(&data.features, &data.labels, None, &boundaries),
        &config,
    )
    .unwrap();
    config.options.precision.storage = StoragePrecision::Single;
    let single = fit(
        split_dense(&data.features, &data.labels, None, &boundaries),
        &config,
    )
    .unwrap();
    assert!(max_abs_diff(single.model.coefficients(), double.model.coefficients()) < 1e-4);
    assert_abs_diff_eq!(single.model.intercept(), double.model.intercept(), epsilon = 1e-4);
}

#[test]
fn repeated_direct_fits_are_bit_identical() {
    let data = synthetic(250, &[0.3, -0.7, 1.1, 0.0], 0.2, 0.3, 91);
    let config = ridge_config(0.1, true, true);
    let run = || {
        let mut recorder = RecordingFitProgress::default();
        let group = CollectiveGroup::new(5);
        let outcome = ConvergenceController::new(&config)
            .unwrap()
            .fit(
                split_dense(&data.features, &data.labels, None, &even_boundaries(250, 5)),
                &group,
                &mut recorder,
            )
            .unwrap();
        (outcome.model, recorder)
    };
    let (first_model, first_trace) = run();
    let (second_model, second_trace) = run();
    assert_eq!(first_model, second_model);
    assert_eq!(first_trace, second_trace);
    assert_eq!(first_trace.iterations.len(), 1);
}

#[test]
fn penalty_is_scaled_per_unit_of_weight() {
    // x = [1, 2, 3, 4], y = 2x: Σx² = 30, Σxy = 60 over W = 4 rows.
    let features = Array2::from_shape_vec((4, 1), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
    let labels = Array1::from(vec![2.0, 4.0, 6.0, 8.0]);
    let config = ridge_config(0.5, false, false);

    // (30/4 + 0.5) β = 60/4, so β = 1.875; the unscaled system would give 60/30.5.
    let outcome = fit(split_dense(&features, &labels, None, &[2]), &config).unwrap();
    assert_abs_diff_eq!(outcome.model.coefficients()[0], 1.875, epsilon = 1e-12);
    assert!((outcome.model.coefficients()[0] - 60.0 / 30.5).abs() > 0.05);
    assert_eq!(outcome.model.intercept(), 0.0);

    // Uniformly doubled weights leave a per-sample penalty unchanged.
    let weights = Array1::from_elem(4, 2.0);
    let weighted = fit(split_dense(&features, &labels, Some(&weights), &[1]), &config).unwrap();
    assert_abs_diff_eq!(weighted.model.coefficients()[0], 1.875, epsilon = 1e-12);
    assert_abs_diff_eq!(weighted.summary.total_weight, 8.0, epsilon = 1e-12);
}

#[test]
fn time_limit_before_the_solve_still_reports_totals() {
    let data = synthetic(200, &[1.0, -1.0], 0.5, 0.1, 101);
    for (standardization, fit_intercept) in [(true, true), (false, false)] {
        let mut config = ridge_config(0.1, standardization, fit_intercept);
        config.options.max_wall_time_secs = Some(1e-9);
        let outcome = fit(split_dense(&data.features, &data.labels, None, &[80, 150]), &config)
            .unwrap();
        assert_eq!(outcome.status, FitStatus::TimeLimitReached);
        assert_eq!(outcome.summary.iterations, 0);
        assert_eq!(outcome.summary.num_rows, 200);
        assert_eq!(outcome.summary.num_ranks, 3);
        assert_abs_diff_eq!(outcome.summary.total_weight, 200.0, epsilon = 1e-9);
        assert!(outcome.model.coefficients().iter().all(|b| *b == 0.0));
    }
}
