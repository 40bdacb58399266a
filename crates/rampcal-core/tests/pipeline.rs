use ndarray::{Array2, Array3};
use rampcal_core::common::PipelineConfig;
use rampcal_core::detector::{
    ChannelOffsetCorrector, DetectorGeometry, DetectorTiming, MemoryRampSource, ReferenceBorders,
    ScanLayout,
};
use rampcal_core::pipelines::CalibrationSession;
use rampcal_core::Verbosity;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

const SIZE: usize = 64;
const FRAMES: usize = 16;
const RAMPS: usize = 5;
const HOT_SITES: [usize; 4] = [12, 24, 40, 52];
const HOT_RATE: f64 = 80.0;
const DARK_RATE: f64 = 0.05;
const ALPHA: f64 = 0.015;

fn config() -> PipelineConfig {
    let mut config = PipelineConfig {
        geometry: DetectorGeometry {
            rows: SIZE,
            cols: SIZE,
            channel_count: 2,
            channel_width: 32,
            borders: ReferenceBorders::uniform(4),
            scan_layout: ScanLayout::default(),
        },
        timing: DetectorTiming {
            frame_time: 10.0,
            group_count: FRAMES,
            ..DetectorTiming::default()
        },
        ..PipelineConfig::default()
    };
    config.bias.worker_count = 2;
    config.bias.verbosity = Verbosity::Quiet;
    config.dark.verbosity = Verbosity::Quiet;
    config.noise.verbosity = Verbosity::Quiet;
    config.power_spectrum.verbosity = Verbosity::Quiet;
    config.effective_noise.verbosity = Verbosity::Quiet;
    config
}

fn rate_image(geometry: &DetectorGeometry) -> Array2<f64> {
    let mut rate = Array2::from_shape_fn(geometry.shape(), |(row, col)| {
        if geometry.is_reference(row, col) { 0.0 } else { DARK_RATE }
    });
    for row in HOT_SITES {
        for col in HOT_SITES {
            rate[(row, col)] += HOT_RATE * (1.0 - 4.0 * ALPHA);
            for (r, c) in [(row - 1, col), (row + 1, col), (row, col - 1), (row, col + 1)] {
                rate[(r, c)] += HOT_RATE * ALPHA;
            }
        }
    }
    rate
}

/// Bias pattern, per-ramp kTC, per-frame channel offsets and white read noise
/// on top of a hot-pixel dark current.
fn source(geometry: &DetectorGeometry) -> MemoryRampSource {
    let mut rng = StdRng::seed_from_u64(2024);
    let read = Normal::new(0.0, 5.0).expect("normal");
    let ktc = Normal::new(0.0, 8.0).expect("normal");
    let offset = Normal::new(0.0, 5.0).expect("normal");
    let rate = rate_image(geometry);
    let bias = Array2::from_shape_fn(geometry.shape(), |(row, col)| {
        10_000.0 + ((row * 7 + col * 13) % 29) as f64
    });
    let ramps = (0..RAMPS)
        .map(|_| {
            let reset = bias.mapv(|level| level + ktc.sample(&mut rng));
            let offsets: Vec<[f64; 2]> = (0..FRAMES)
                .map(|_| [offset.sample(&mut rng), offset.sample(&mut rng)])
                .collect();
            Array3::from_shape_fn((FRAMES, SIZE, SIZE), |(k, r, c)| {
                let elapsed = 10.0 * (k + 1) as f64;
                reset[(r, c)]
                    + rate[(r, c)] * elapsed
                    + offsets[k][geometry.channel_of_column(c)]
                    + read.sample(&mut rng)
            })
        })
        .collect();
    MemoryRampSource::from_ramps(ramps)
}

#[test]
fn staged_session_measures_kernels_and_slope_noise() {
    let config = config();
    let geometry = config.geometry;
    let source = source(&geometry);
    let corrector = ChannelOffsetCorrector::new(geometry);
    let session = CalibrationSession::new(config).expect("session");

    let bias = session.run_super_bias(&source, &corrector).expect("super bias");
    assert_eq!(bias.super_bias.mean.dim(), (SIZE, SIZE));

    let dark = session
        .run_dark_ramp(&source, &corrector, &bias.super_bias)
        .expect("dark ramp");
    assert_eq!(dark.products.ensemble_size, RAMPS);
    assert_eq!(dark.times.len(), FRAMES);
    let hot = dark.super_dark[(24, 40)];
    assert!((hot - HOT_RATE * (1.0 - 4.0 * ALPHA)).abs() < 1.0, "hot slope = {hot}");
    assert!((dark.dark_current - 2.0 * DARK_RATE).abs() < 0.05, "{}", dark.dark_current);

    let kernels = session
        .run_kernels(&dark)
        .expect("kernels")
        .expect("sixteen hot pixels");
    let (alpha, _) = kernels.ipc.coupling_fraction();
    assert!((alpha - ALPHA).abs() < 0.003, "alpha = {alpha}");

    let curves = session
        .run_effective_noise(&source, &corrector, &dark, Some(&kernels))
        .expect("effective noise");
    assert_eq!(curves.len(), 1);
    let curve = &curves[0];
    assert_eq!(curve.ramp_count, RAMPS);
    let noise = curve.channel_noise(geometry.channel_count).expect("channel noise");
    assert_eq!(noise.len(), curve.group_counts.len());
    let first = noise.first().copied().expect("at least one group count");
    let last = noise.last().copied().expect("at least one group count");
    assert!(first > last, "slope noise should fall with group count: {noise:?}");
}

#[test]
fn full_session_produces_a_complete_report() {
    let config = config();
    let geometry = config.geometry;
    let source = source(&geometry);
    let corrector = ChannelOffsetCorrector::new(geometry);
    let session = CalibrationSession::new(config).expect("session");

    let report = session.run_all(&source, &corrector).expect("report");
    assert_eq!(report.ramps, RAMPS);
    let [alpha, _] = report.ipc.expect("IPC measured");
    assert!((alpha - ALPHA).abs() < 0.003, "alpha = {alpha}");
    assert!(report.ppc.is_none());
    assert_eq!(report.noise.white.len(), 2);
    assert!(report.noise.white.iter().all(|value| value.is_finite() && *value > 0.0));
    assert!(report.reference.is_some());
    assert!(report.excess.residual_count >= 2);
    assert!(report.column_probability.is_finite());

    let rendered = serde_json::to_value(&report).expect("report serializes");
    assert_eq!(rendered["ramps"], RAMPS);
}
