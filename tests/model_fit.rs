use approx::assert_abs_diff_eq;
use ndarray::{Array1, Array2, s};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rfest::design::build_design_matrix;
use rfest::{
    Distribution, FilterSpec, FitOptions, Glm, GlmConfig, GlmError, InitMethod, InitOptions,
    Metric, Nonlinearity, RawInput, ResponseSet, SelectionPolicy, SmoothingKind, Split,
    StimulusInput, WeightType,
};

const LAGS: usize = 3;
const PIXELS: usize = 6;

fn true_filter() -> Array1<f64> {
    Array1::from_shape_fn(LAGS * PIXELS, |i| (i as f64 * 0.5).sin())
}

/// White-noise frames and a noisy linear response to `true_filter`.
fn recording(n: usize, seed: u64) -> (Array2<f64>, Array1<f64>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let x = Array2::from_shape_fn((n, PIXELS), |_| rng.sample::<f64, _>(StandardNormal));
    let design = build_design_matrix(x.view(), LAGS, 0).unwrap();
    let noise = Array1::from_shape_fn(n, |_| 0.1 * rng.sample::<f64, _>(StandardNormal));
    let y = design.dot(&true_filter()) + noise;
    (x, y)
}

fn gaussian_model(x: &Array2<f64>, dev: Option<&Array2<f64>>) -> Glm {
    let mut model = Glm::new(GlmConfig {
        distribution: Distribution::Gaussian,
        output_nonlinearity: Nonlinearity::None,
        ..GlmConfig::default()
    });
    let df = (PIXELS / 3).max(3);
    model
        .add_filter(
            x,
            FilterSpec::new("stimulus")
                .dims([LAGS, PIXELS])
                .degrees_of_freedom([3, df])
                .smoothing(SmoothingKind::CubicRegression),
        )
        .unwrap();
    if let Some(dev) = dev {
        model
            .add_filter(dev, FilterSpec::new("stimulus").split(Split::Dev))
            .unwrap();
    }
    model
}

fn mle_options() -> InitOptions {
    InitOptions {
        method: InitMethod::Mle,
        ..InitOptions::default()
    }
}

#[test]
fn gaussian_fit_tracks_a_fresh_stimulus() {
    let (x, y) = recording(600, 1);
    let (x_test, y_test) = recording(300, 2);
    let mut model = gaussian_model(&x, None);
    model.initialize(Some(y.into()), &mle_options()).unwrap();

    let (mle_score, prediction) = model
        .score(&x_test, y_test.view(), Metric::Corrcoef, WeightType::Mle, true)
        .unwrap();
    assert!(mle_score > 0.5, "mle corrcoef {mle_score}");
    assert_eq!(prediction.map(|p| p.len()), Some(300 - model.burn_in()));

    let trace = model
        .fit(
            None,
            &FitOptions {
                max_iters: 200,
                step_size: 0.1,
                beta: 0.1,
                ..FitOptions::default()
            },
        )
        .unwrap();
    assert!(trace.len() <= 200);
    assert!(trace.train_costs().iter().all(|c| c.is_finite()));

    let (opt_score, prediction) = model
        .score(&x_test, y_test.view(), Metric::Corrcoef, WeightType::Opt, false)
        .unwrap();
    assert!(opt_score > -0.5, "opt corrcoef {opt_score}");
    assert!(prediction.is_none());
}

#[test]
fn best_dev_cost_selects_the_exhaustive_argmin() {
    let (x, y) = recording(450, 3);
    let (x_train, x_dev) = (x.slice(s![..300, ..]).to_owned(), x.slice(s![300.., ..]).to_owned());
    let response = ResponseSet::new(y.slice(s![..300]).to_owned(), Some(y.slice(s![300..]).to_owned()));
    let mut model = gaussian_model(&x_train, Some(&x_dev));
    model.initialize(Some(response.clone()), &InitOptions::default()).unwrap();

    let trace = model
        .fit(
            Some(response),
            &FitOptions {
                max_iters: 80,
                step_size: 0.05,
                selection: SelectionPolicy::BestDevCost,
                ..FitOptions::default()
            },
        )
        .unwrap()
        .clone();

    assert!(trace.len() <= 80);
    let dev_costs = trace.dev_costs().expect("dev costs are recorded with a dev split");
    let mut best = 0;
    for (i, &cost) in dev_costs.iter().enumerate() {
        if cost < dev_costs[best] {
            best = i;
        }
    }
    assert_eq!(trace.selected, best);
    assert_eq!(model.parameters(WeightType::Opt), Some(&trace.entries[best].parameters));
    assert_eq!(trace.metric_dev_opt(), trace.entries[best].dev_metric);

    let dev_prediction = model.prediction(WeightType::Opt, Split::Dev).unwrap();
    let expected = model.forward_pass(&trace.entries[best].parameters, Split::Dev).unwrap();
    assert_abs_diff_eq!(dev_prediction, &expected, epsilon = 1e-12);
}

#[test]
fn subunit_expansion_renames_the_stimulus_filter() {
    let (x, y) = recording(200, 4);
    let mut model = gaussian_model(&x, None);
    let original = model.filter("stimulus").unwrap().clone();

    model
        .initialize(
            None,
            &InitOptions {
                num_subunits: 3,
                ..InitOptions::default()
            },
        )
        .unwrap();

    assert_eq!(model.filter_names(), ["stimulus_s0", "stimulus_s1", "stimulus_s2"]);
    assert!(model.filter("stimulus").is_none());
    for name in model.filter_names() {
        let filter = model.filter(name).unwrap();
        assert_eq!(filter.dims, original.dims);
        assert_eq!(filter.shift, original.shift);
        assert_eq!(filter.nonlinearity, original.nonlinearity);
    }
    assert_eq!(model.num_subunits(), 3);

    // the first draw happens before expansion and is shared by every alias
    let random = model.parameters(WeightType::Random).unwrap();
    assert_eq!(random.coefficients.len(), 3);
    assert_eq!(random.coefficients("stimulus_s0"), random.coefficients("stimulus_s2"));

    // a second draw is seeded per subunit
    model.initialize(None, &InitOptions { num_subunits: 3, ..InitOptions::default() }).unwrap();
    let random = model.parameters(WeightType::Random).unwrap();
    assert_ne!(random.coefficients("stimulus_s0"), random.coefficients("stimulus_s1"));

    model
        .fit(Some(y.into()), &FitOptions { max_iters: 5, ..FitOptions::default() })
        .unwrap();
    let (x_test, _) = recording(50, 5);
    let prediction = model.predict(&x_test, WeightType::Opt).unwrap();
    assert_eq!(prediction.len(), 50 - model.burn_in());
}

#[test]
fn mle_is_deterministic_and_covariance_non_negative() {
    let (x, y) = recording(300, 6);
    let mut first = gaussian_model(&x, None);
    let mut second = gaussian_model(&x, None);
    first.compute_mle(y.clone().into(), true).unwrap();
    second.compute_mle(y.into(), true).unwrap();

    assert_eq!(first.parameters(WeightType::Mle), second.parameters(WeightType::Mle));
    let store = first.variance(WeightType::Mle).unwrap();
    let stimulus = &store.filters["stimulus"];
    assert!(stimulus.covariance.iter().all(|&v| v >= 0.0));
    assert_eq!(stimulus.weight_se.len(), LAGS * PIXELS);

    let bands = store.response(Split::Train).unwrap();
    let prediction = first.prediction(WeightType::Mle, Split::Train).unwrap();
    assert_abs_diff_eq!(&bands.prediction, prediction, epsilon = 1e-12);
    assert!(bands.lower.iter().zip(&bands.upper).all(|(lo, hi)| lo <= hi));
}

#[test]
fn poisson_fit_keeps_finite_costs() {
    let mut rng = StdRng::seed_from_u64(7);
    let n = 400;
    let x = Array2::from_shape_fn((n, 2), |_| rng.sample::<f64, _>(StandardNormal));
    let design = build_design_matrix(x.view(), 4, 0).unwrap();
    let w = Array1::from_shape_fn(8, |i| 0.3 * (i as f64).cos());
    let y = design.dot(&w).mapv(|v| (1.0 + v.exp()).ln().round());

    let mut model = Glm::new(GlmConfig {
        distribution: Distribution::Poisson,
        output_nonlinearity: Nonlinearity::Softplus,
        ..GlmConfig::default()
    });
    model
        .add_filter(
            &x,
            FilterSpec::new("stimulus")
                .dims([4, 2])
                .degrees_of_freedom([3, 2])
                .smoothing(SmoothingKind::BSpline)
                .penalty_weight(0.1),
        )
        .unwrap();
    model.initialize(Some(y.into()), &mle_options()).unwrap();
    let trace = model
        .fit(
            None,
            &FitOptions {
                max_iters: 50,
                step_size: 0.01,
                selection: SelectionPolicy::BestTrainCost,
                ..FitOptions::default()
            },
        )
        .unwrap();

    let costs = trace.train_costs();
    assert!(costs.iter().all(|c| c.is_finite()));
    // no dev split, so the last iterate wins
    assert_eq!(trace.selected, trace.len() - 1);
    let store = model.variance(WeightType::Opt).unwrap();
    assert!(store.filters["stimulus"].covariance.iter().all(|&v| v >= 0.0));
    assert!(model.prediction(WeightType::Opt, Split::Train).unwrap().iter().all(|&r| r > 0.0));
}

#[test]
fn unlagged_design_is_the_raw_input() {
    let mut rng = StdRng::seed_from_u64(8);
    let x = Array2::from_shape_fn((40, 4), |_| rng.sample::<f64, _>(StandardNormal));
    let mut model = Glm::new(GlmConfig::default());
    model
        .add_filter(&x, FilterSpec::new("stimulus").dims([4]).without_time_lag())
        .unwrap();
    assert_eq!(model.burn_in(), 0);
    let entry = model.registry().design(Split::Train, "stimulus").unwrap();
    assert_eq!(entry.raw, x);
    assert!(entry.projected.is_none());
}

#[test]
fn named_prediction_uses_every_listed_filter() {
    let (x, y) = recording(200, 9);
    let history = y.clone();
    let mut model = gaussian_model(&x, None);
    model
        .add_filter(&history, FilterSpec::new("history").dims([2]).shift(1))
        .unwrap();
    model
        .initialize(Some(y.into()), &InitOptions { compute_ci: false, ..mle_options() })
        .unwrap();

    let (x_test, y_test) = recording(60, 10);
    let named = StimulusInput::Named(vec![
        ("stimulus".to_string(), RawInput::from(&x_test)),
        ("history".to_string(), RawInput::from(&y_test)),
    ]);
    let prediction = model.predict(named, WeightType::Mle).unwrap();
    assert_eq!(prediction.len(), 60 - model.burn_in());

    let unknown = StimulusInput::Named(vec![("spikes".to_string(), RawInput::from(&y_test))]);
    assert!(matches!(
        model.predict(unknown, WeightType::Mle),
        Err(GlmError::UnknownFilter { split: Split::Test, .. })
    ));
    assert!(matches!(
        model.predict(&x_test, WeightType::Opt),
        Err(GlmError::ParametersUnavailable(WeightType::Opt))
    ));
}

#[test]
fn prediction_with_intervals_records_test_bands() {
    let (x, y) = recording(300, 11);
    let (x_test, _) = recording(120, 12);
    let mut model = gaussian_model(&x, None);
    model.compute_mle(y.into(), true).unwrap();
    let y_pred = model.predict(&x_test, WeightType::Mle).unwrap();

    let bands = model
        .variance(WeightType::Mle)
        .and_then(|store| store.response(Split::Test))
        .expect("test bands after predict");
    assert_eq!(bands.prediction.len(), y_pred.len());
    assert_abs_diff_eq!(&bands.prediction, &y_pred, epsilon = 1e-12);
    assert_eq!(bands.filter_se["stimulus"].len(), y_pred.len());
    assert!(
        bands
            .lower
            .iter()
            .zip(&bands.prediction)
            .zip(&bands.upper)
            .all(|((lo, p), hi)| lo <= p && p <= hi)
    );
}

#[test]
fn cost_rejects_a_prediction_of_the_wrong_length() {
    let (x, y) = recording(200, 13);
    let mut model = gaussian_model(&x, None);
    model.compute_mle(y.into(), false).unwrap();
    let params = model.parameters(WeightType::Mle).unwrap();
    let rows = model.response(Split::Train).unwrap().len();

    let short = Array1::zeros(rows - 5);
    assert!(matches!(
        model.cost(params, Split::Train, Some(short.view()), false),
        Err(GlmError::RowMismatch {
            split: Split::Train,
            expected,
            found,
            ..
        }) if expected == rows - 5 && found == rows
    ));
    assert!(model.cost(params, Split::Train, None, true).unwrap().is_finite());
}

#[test]
fn replacing_the_dev_stimulus_with_a_longer_one_fails_the_fit() {
    let (x, y) = recording(300, 14);
    let (x_dev, y_dev) = recording(150, 15);
    let (x_longer, _) = recording(200, 16);
    let mut model = gaussian_model(&x, Some(&x_dev));
    model
        .initialize(Some(ResponseSet::new(y, Some(y_dev))), &mle_options())
        .unwrap();
    model
        .add_filter(&x_longer, FilterSpec::new("stimulus").split(Split::Dev))
        .unwrap();

    let result = model.fit(
        None,
        &FitOptions {
            max_iters: 5,
            ..FitOptions::default()
        },
    );
    assert!(matches!(
        result,
        Err(GlmError::RowMismatch { split: Split::Dev, .. })
    ));
}
