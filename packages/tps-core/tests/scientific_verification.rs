use approx::{assert_abs_diff_eq, assert_relative_eq};
use ndarray::{array, Array2, Array3, Zip};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io::Write;
use tps_core::{
    coefficients_from_correspondence, dense_grid, evaluate, fit, remap_bicubic, to_pixel_maps,
    uniform_grid, warp, warp_with_config, warp_with_report, CoefficientForm, SplineParams,
    TpsError, WarpConfig,
};

/// Random control points in the unit square, kept at least `min_sep` apart so
/// the system stays well conditioned.
fn random_points(rng: &mut StdRng, n: usize, min_sep: f64) -> Array2<f64> {
    let mut pts: Vec<[f64; 2]> = Vec::with_capacity(n);
    while pts.len() < n {
        let p = [rng.gen_range(0.0..1.0), rng.gen_range(0.0..1.0)];
        let far_enough = pts
            .iter()
            .all(|q| ((p[0] - q[0]).powi(2) + (p[1] - q[1]).powi(2)).sqrt() >= min_sep);
        // Reject a nearly degenerate first triangle.
        let spread = if pts.len() == 2 {
            let (a, b) = (pts[0], pts[1]);
            ((b[0] - a[0]) * (p[1] - a[1]) - (b[1] - a[1]) * (p[0] - a[0])).abs() > 0.05
        } else {
            true
        };
        if far_enough && spread {
            pts.push(p);
        }
    }
    Array2::from_shape_fn((n, 2), |(i, k)| pts[i][k])
}

/// The four image corners plus an interior pair pulled toward the center.
fn demo_landmarks() -> (Array2<f64>, Array2<f64>) {
    let src = array![
        [0.0, 0.0],
        [1.0, 0.0],
        [1.0, 1.0],
        [0.0, 1.0],
        [0.3, 0.3],
        [0.7, 0.7],
    ];
    let dst = array![
        [0.0, 0.0],
        [1.0, 0.0],
        [1.0, 1.0],
        [0.0, 1.0],
        [0.4, 0.4],
        [0.6, 0.6],
    ];
    (src, dst)
}

#[test]
fn test_exact_interpolation_random_sets() {
    let mut rng = StdRng::seed_from_u64(7);
    for &n in &[3usize, 6, 12, 24] {
        let xy = random_points(&mut rng, n, 0.05);
        let mut control = Array2::<f64>::zeros((n, 3));
        for i in 0..n {
            control[[i, 0]] = xy[[i, 0]];
            control[[i, 1]] = xy[[i, 1]];
            control[[i, 2]] = rng.gen_range(-1.0..1.0);
        }

        let theta = fit(control.view(), &SplineParams::default(), CoefficientForm::Full).unwrap();
        let values = evaluate(xy.view(), control.view(), &theta).unwrap();
        for i in 0..n {
            assert_abs_diff_eq!(values[i], control[[i, 2]], epsilon = 1e-4);
        }
    }
}

#[test]
fn test_reduced_form_matches_full_form() {
    let mut rng = StdRng::seed_from_u64(11);
    let dst = random_points(&mut rng, 9, 0.08);
    let src = dst.mapv(|v| v + rng.gen_range(-0.05..0.05));
    let params = SplineParams::default();

    let full =
        coefficients_from_correspondence(src.view(), dst.view(), &params, CoefficientForm::Full)
            .unwrap();
    let reduced =
        coefficients_from_correspondence(src.view(), dst.view(), &params, CoefficientForm::Reduced)
            .unwrap();
    assert_eq!(full.dx.len(), dst.nrows() + 3);
    assert_eq!(reduced.dx.len(), dst.nrows() + 2);

    // Queries extend past the landmark hull to exercise extrapolation.
    let queries = Array2::from_shape_fn((200, 2), |_| rng.gen_range(-0.2..1.2));
    for (f, r) in [(&full.dx, &reduced.dx), (&full.dy, &reduced.dy)] {
        let a = evaluate(queries.view(), dst.view(), f).unwrap();
        let b = evaluate(queries.view(), dst.view(), r).unwrap();
        Zip::from(&a)
            .and(&b)
            .for_each(|&x, &y| assert_abs_diff_eq!(x, y, epsilon = 1e-9));
    }
}

#[test]
fn test_identity_correspondence_is_identity_warp() {
    let (src, _) = demo_landmarks();
    let pair = coefficients_from_correspondence(
        src.view(),
        src.view(),
        &SplineParams::default(),
        CoefficientForm::Reduced,
    )
    .unwrap();

    let identity = uniform_grid(24, 32).unwrap();
    let grid = dense_grid(&pair, src.view(), (24, 32)).unwrap();
    Zip::from(&grid.view())
        .and(&identity.view())
        .for_each(|&g, &u| assert_abs_diff_eq!(g, u, epsilon = 1e-12));

    let image = Array3::from_shape_fn((24, 32, 2), |(i, j, c)| {
        ((i as f64 * 0.7).sin() + (j as f64 * 0.3).cos()) * (c + 1) as f64
    });
    let warped = warp(image.view(), src.view(), src.view(), None).unwrap();
    let expected = remap_bicubic(image.view(), &to_pixel_maps(&identity, (24, 32)), 0.0).unwrap();
    Zip::from(&warped)
        .and(&expected)
        .for_each(|&w, &e| assert_abs_diff_eq!(w, e, epsilon = 1e-9));
}

#[test]
fn test_grid_corners() {
    let grid = uniform_grid(2, 2).unwrap();
    let g = grid.view();
    let corners = [
        ((0, 0), (0.0, 0.0)),
        ((0, 1), (1.0, 0.0)),
        ((1, 0), (0.0, 1.0)),
        ((1, 1), (1.0, 1.0)),
    ];
    for ((i, j), (x, y)) in corners {
        assert_eq!(g[[i, j, 0]], x);
        assert_eq!(g[[i, j, 1]], y);
    }
}

#[test]
fn test_pixel_maps_scale_linearly() {
    let (src, dst) = demo_landmarks();
    let pair = coefficients_from_correspondence(
        src.view(),
        dst.view(),
        &SplineParams::default(),
        CoefficientForm::Reduced,
    )
    .unwrap();
    let grid = dense_grid(&pair, dst.view(), (16, 16)).unwrap();

    let base = to_pixel_maps(&grid, (64, 64));
    let wide = to_pixel_maps(&grid, (64, 128));
    Zip::from(&base.map_x)
        .and(&wide.map_x)
        .for_each(|&a, &b| assert_relative_eq!(b, 2.0 * a, max_relative = 1e-6));
    assert_eq!(base.map_y, wide.map_y);
}

#[test]
fn test_end_to_end_landmark_moves() {
    let size = 512;
    let (src, dst) = demo_landmarks();

    // Gaussian blob centered on the source landmark (0.3, 0.3).
    let center = 0.3 * size as f64;
    let sigma = 4.0;
    let image = Array3::from_shape_fn((size, size, 1), |(i, j, _)| {
        let d2 = (i as f64 - center).powi(2) + (j as f64 - center).powi(2);
        255.0 * (-d2 / (2.0 * sigma * sigma)).exp()
    });

    let warped = warp(image.view(), src.view(), dst.view(), Some((size, size))).unwrap();
    assert_eq!(warped.dim(), (size, size, 1));

    let mut best = (0usize, 0usize, f64::MIN);
    for ((i, j, _), &v) in warped.indexed_iter() {
        if v > best.2 {
            best = (i, j, v);
        }
    }

    let expected = 0.4 * (size - 1) as f64;
    assert!(best.2 > 100.0, "blob vanished: peak {}", best.2);
    assert!(
        (best.0 as f64 - expected).abs() <= 3.0 && (best.1 as f64 - expected).abs() <= 3.0,
        "peak at ({}, {}), expected near {:.1}",
        best.0,
        best.1,
        expected
    );
}

#[test]
fn test_out_of_range_sampling_is_zero_filled() {
    // Pulling the whole frame outward samples outside the source.
    let src = array![[-0.5, -0.5], [1.5, -0.5], [1.5, 1.5], [-0.5, 1.5], [0.5, 0.5]];
    let dst = array![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0], [0.5, 0.5]];
    let image = Array3::from_elem((32, 32, 1), 10.0);
    let warped = warp(image.view(), src.view(), dst.view(), None).unwrap();
    assert_eq!(warped[[0, 0, 0]], 0.0);
    assert_eq!(warped[[31, 31, 0]], 0.0);
}

#[test]
fn test_duplicate_landmarks_need_smoothing() {
    let src = array![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [0.2, 0.2], [0.3, 0.2]];
    let dst = array![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [0.25, 0.25], [0.25, 0.25]];

    let err = coefficients_from_correspondence(
        src.view(),
        dst.view(),
        &SplineParams::default(),
        CoefficientForm::Reduced,
    )
    .unwrap_err();
    assert!(err.is_singular(), "unexpected error: {err}");

    let smoothed = coefficients_from_correspondence(
        src.view(),
        dst.view(),
        &SplineParams::with_smoothing(0.1),
        CoefficientForm::Reduced,
    );
    assert!(smoothed.is_ok());
}

#[test]
fn test_contract_violations() {
    let image = Array3::<f64>::zeros((8, 8, 1));
    let three = array![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0]];
    let two = array![[0.0, 0.0], [1.0, 0.0]];
    let three_d = array![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];

    assert!(matches!(
        warp(image.view(), three.view(), two.view(), None),
        Err(TpsError::ShapeMismatch { .. })
    ));
    assert!(matches!(
        warp(image.view(), two.view(), two.view(), None),
        Err(TpsError::TooFewPoints { required: 3, actual: 2 })
    ));
    assert!(matches!(
        warp(image.view(), three_d.view(), three_d.view(), None),
        Err(TpsError::ShapeMismatch { .. })
    ));
    assert!(matches!(
        warp(image.view(), three.view(), three.view(), Some((0, 8))),
        Err(TpsError::InvalidDimensions(_))
    ));
}

#[test]
fn test_report_from_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("warp.json");
    let mut f = std::fs::File::create(&path).unwrap();
    f.write_all(br#"{ "reduced": false, "border_value": 0.0, "jobs": 1 }"#)
        .unwrap();
    drop(f);

    let config = WarpConfig::from_json_file(&path).unwrap();
    assert_eq!(config.form(), CoefficientForm::Full);
    assert_eq!(config.jobs, 1);

    let (src, dst) = demo_landmarks();
    let image = Array3::from_elem((20, 20, 1), 1.0);
    let (warped, report) =
        warp_with_report(image.view(), src.view(), dst.view(), None, &config).unwrap();
    let plain = warp_with_config(image.view(), src.view(), dst.view(), None, &config).unwrap();

    assert_eq!(warped, plain);
    assert_eq!(report.residuals.errors.len(), 6);
    assert_abs_diff_eq!(report.residuals.max_error, 0.0, epsilon = 1e-9);
}

#[test]
fn test_missing_config_file_is_reported() {
    let err = WarpConfig::from_json_file("/nonexistent/warp.json").unwrap_err();
    assert!(matches!(err, TpsError::ConfigRead { .. }));
}

#[test]
fn test_nearly_duplicate_landmarks_are_singular() {
    let src = array![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [0.5, 0.5], [0.6, 0.5]];
    let dst = array![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [0.5, 0.5], [0.5 + 1e-9, 0.5]];

    let err = coefficients_from_correspondence(
        src.view(),
        dst.view(),
        &SplineParams::default(),
        CoefficientForm::Reduced,
    )
    .unwrap_err();
    assert!(err.is_singular(), "unexpected error: {err}");
}

#[test]
fn test_pixel_space_landmarks_fit_exactly() {
    let mut rng = StdRng::seed_from_u64(23);
    let unit = random_points(&mut rng, 10, 0.08);
    for &size in &[512.0, 4096.0] {
        let dst = unit.mapv(|v| v * size);
        let src = dst.mapv(|v| v + rng.gen_range(-20.0..20.0));
        let pair = coefficients_from_correspondence(
            src.view(),
            dst.view(),
            &SplineParams::default(),
            CoefficientForm::Reduced,
        )
        .unwrap_or_else(|e| panic!("size {size}: {e}"));

        let dx = evaluate(dst.view(), dst.view(), &pair.dx).unwrap();
        let dy = evaluate(dst.view(), dst.view(), &pair.dy).unwrap();
        for i in 0..dst.nrows() {
            assert_abs_diff_eq!(dst[[i, 0]] + dx[i], src[[i, 0]], epsilon = 1e-6);
            assert_abs_diff_eq!(dst[[i, 1]] + dy[i], src[[i, 1]], epsilon = 1e-6);
        }
    }
}
