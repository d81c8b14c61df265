use azimrs::integrator::build_lut;
use azimrs::{
    AngularGeometry, BinningStrategy, DeviceClass, Integrator, IntegratorConfig, LutLayout,
    Precision,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

const SIDE: usize = 512;
const N_BINS: usize = 1000;

/// Angle of each pixel from the detector center, with a constant half-width.
fn ring_geometry() -> (Vec<f64>, Vec<f64>) {
    let center = SIDE as f64 / 2.0;
    let tth: Vec<f64> = (0..SIDE * SIDE)
        .map(|i| {
            let (row, col) = ((i / SIDE) as f64, (i % SIDE) as f64);
            ((row - center).hypot(col - center) / center).atan()
        })
        .collect();
    let half_width = vec![0.5 / center; tth.len()];
    (tth, half_width)
}

fn ring_image(tth: &[f64]) -> Vec<f64> {
    tth.iter().map(|t| 100.0 * (-(t * 20.0).powi(2)).exp() + 5.0).collect()
}

fn prepared(strategy: BinningStrategy, precision: Precision) -> Integrator {
    let settings = IntegratorConfig::new(DeviceClass::Any, precision).with_strategy(strategy);
    let integrator = Integrator::new(settings);
    integrator.init_default().unwrap();
    integrator.configure(SIDE * SIDE, N_BINS, None).unwrap();

    let (tth, half_width) = ring_geometry();
    integrator.load_geometry(&tth, &half_width, None, None).unwrap();
    integrator
}

fn bench_execute(c: &mut Criterion) {
    let (tth, _) = ring_geometry();
    let image = ring_image(&tth);

    let mut group = c.benchmark_group("execute");
    group.sample_size(20);

    let strategies = [
        ("lut_pixel_major", BinningStrategy::LookupTable(LutLayout::PixelMajor)),
        ("lut_bin_major", BinningStrategy::LookupTable(LutLayout::BinMajor)),
        ("direct_histogram", BinningStrategy::DirectHistogram),
    ];
    for (name, strategy) in strategies {
        for precision in [Precision::Single, Precision::Double] {
            let integrator = prepared(strategy, precision);
            let id = BenchmarkId::new(name, format!("{precision:?}"));
            group.bench_with_input(id, &image, |b, image| {
                b.iter(|| black_box(integrator.execute(black_box(image)).unwrap()))
            });
        }
    }
    group.finish();
}

fn bench_corrections(c: &mut Criterion) {
    let (tth, _) = ring_geometry();
    let image = ring_image(&tth);
    let n = image.len();

    let integrator = prepared(
        BinningStrategy::LookupTable(LutLayout::BinMajor),
        Precision::Double,
    );
    integrator.set_dark(&vec![5.0; n]).unwrap();
    integrator.set_flat(&vec![1.1; n]).unwrap();
    integrator.set_solid_angle(&vec![0.9; n]).unwrap();
    integrator.set_mask(&vec![0u8; n]).unwrap();
    integrator.set_dummy_value(-1.0, 0.0).unwrap();

    c.bench_function("execute_all_corrections", |b| {
        b.iter(|| black_box(integrator.execute(black_box(&image)).unwrap()))
    });
}

fn bench_build_lut(c: &mut Criterion) {
    let (tth, half_width) = ring_geometry();
    let geometry = AngularGeometry::new(tth, half_width, Precision::Double).unwrap();

    c.bench_function("build_lut_bin_major", |b| {
        b.iter(|| black_box(build_lut(&geometry, N_BINS, LutLayout::BinMajor).unwrap()))
    });
}

criterion_group!(benches, bench_execute, bench_corrections, bench_build_lut);
criterion_main!(benches);
