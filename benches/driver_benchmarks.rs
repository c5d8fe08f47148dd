//! Benchmarks for the optimization driver.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use gradopt::{Driver, EvalFailure, Evaluation};
use ndarray::Array1;

fn benchmark_quartic_analytic(c: &mut Criterion) {
    let p = 50;
    let x0 = Array1::from_elem(p, 2.0);

    c.bench_function("driver_quartic_analytic_50", |b| {
        b.iter(|| {
            let quartic = |x: &Array1<f64>| -> Result<Evaluation, EvalFailure> {
                let f: f64 = x.iter().map(|xi| xi.powi(4)).sum();
                let g: Array1<f64> = x.iter().map(|xi| 4.0 * xi.powi(3)).collect();
                Ok(Evaluation::with_gradient(f, g))
            };
            let result = Driver::new(black_box(x0.clone()), quartic)
                .with_analytic_gradients()
                .with_gradient_tolerance(1e-5)
                .run()
                .expect("valid configuration");
            black_box(result.final_value)
        })
    });
}

fn benchmark_paraboloid_central_difference(c: &mut Criterion) {
    c.bench_function("driver_paraboloid_central_diff", |b| {
        b.iter(|| {
            let paraboloid = |x: &Array1<f64>| -> Result<Evaluation, EvalFailure> {
                Ok(Evaluation::new(
                    (x[0] - 2.0).powi(2) + (x[1] - 3.0).powi(2),
                ))
            };
            let x0 = ndarray::array![0.0, 0.0];
            let result = Driver::new(black_box(x0), paraboloid)
                .run()
                .expect("valid configuration");
            black_box(result.final_value)
        })
    });
}

criterion_group!(
    benches,
    benchmark_quartic_analytic,
    benchmark_paraboloid_central_difference
);
criterion_main!(benches);
