use criterion::{criterion_group, criterion_main, Criterion};
use ndarray::{Array1, Array2};
use pulse_portraiture::alignment::align::{direct_sum, AlignConfig, PortraitAligner, Termination};
use pulse_portraiture::fitting::harmonic::harmonic::HarmonicAligner;
use pulse_portraiture::models::gaussian::{GaussianComponent, GaussianModel, ProfileOptions};
use pulse_portraiture::utils::portrait::{rotate_portrait, Dispersion, Portrait};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

const NCHAN: usize = 64;
const NBIN: usize = 512;
const PERIOD: f64 = 0.005;

fn model(freqs: &Array1<f64>) -> Array2<f64> {
    GaussianModel::new("bench", 1400.0, 0.0)
        .with_component(GaussianComponent::new(0.3, 0.03, 1.0))
        .with_component(GaussianComponent::new(0.45, 0.08, 0.3))
        .portrait(NBIN, freqs.view(), &ProfileOptions::default())
}

fn observation(model: &Array2<f64>, freqs: &Array1<f64>, phase: f64, seed: u64) -> Array2<f64> {
    let dispersion = Dispersion::new(-0.001, PERIOD, freqs.view(), 1400.0);
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 0.1).expect("Invalid noise level");
    rotate_portrait(model.view(), -phase, Some(&dispersion)).mapv(|x| x + normal.sample(&mut rng))
}

fn criterion_benchmark(c: &mut Criterion) {
    let freqs = Array1::linspace(1100.0, 1700.0, NCHAN);
    let model = model(&freqs);
    let data = observation(&model, &freqs, 0.1, 1);
    let aligner = HarmonicAligner::default();
    c.bench_function("Portrait fit", |b| {
        b.iter(|| {
            aligner
                .fit_portrait(data.view(), model.view(), [0.1, 0.0], PERIOD, freqs.view(), 1400.0)
                .expect("Could not fit portrait")
        })
    });

    let observations: Vec<Portrait> = (0..8)
        .map(|i| {
            Portrait::new(observation(&model, &freqs, 0.01 * i as f64, i), freqs.clone(), PERIOD)
                .expect("Could not build portrait")
        })
        .collect();
    let align = PortraitAligner::new(AlignConfig {
        termination: Termination::Iterations(1),
        ..Default::default()
    });
    let initial = direct_sum(&observations).expect("Could not sum observations");
    c.bench_function("Align", |b| {
        b.iter(|| align.align(&observations, initial.clone()).expect("Could not align"))
    });
    c.bench_function("Parallel Align", |b| {
        b.iter(|| align.par_align(&observations, initial.clone()).expect("Could not align"))
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
