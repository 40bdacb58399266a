use ndarray::Array3;
use rampcal_core::common::DarkRampConfig;
use rampcal_core::detector::{DetectorGeometry, PixelMasks, ReferenceBorders, ScanLayout};
use rampcal_core::modules::{DarkRampBuilder, PixelClass, dark_slope_image};
use rampcal_core::Verbosity;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

const FRAMES: usize = 10;
const RATE: f64 = 0.5;
const RISING: (usize, usize) = (6, 5);
const FALLING: (usize, usize) = (9, 12);
const OFFSET: (usize, usize) = (10, 3);

fn geometry() -> DetectorGeometry {
    DetectorGeometry {
        rows: 16,
        cols: 16,
        channel_count: 2,
        channel_width: 8,
        borders: ReferenceBorders::uniform(2),
        scan_layout: ScanLayout::default(),
    }
}

fn times() -> Vec<f64> {
    (1..=FRAMES).map(|k| k as f64 * 10.0).collect()
}

/// Linear dark ramps with white noise, two pixels following a cubic that no
/// quadratic can absorb, and one pixel carrying a large constant offset.
fn ramp(rng: &mut StdRng) -> Array3<f64> {
    let noise = Normal::new(0.0, 2.0).expect("normal");
    let t = times();
    Array3::from_shape_fn((FRAMES, 16, 16), |(k, r, c)| {
        let cubic = 0.02 * (t[k] - 55.0).powi(3);
        let signal = match (r, c) {
            RISING => cubic,
            FALLING => -cubic,
            OFFSET => 20_000.0 + RATE * t[k],
            _ => RATE * t[k],
        };
        signal + noise.sample(rng)
    })
}

fn config() -> DarkRampConfig {
    DarkRampConfig {
        verbosity: Verbosity::Quiet,
        ..DarkRampConfig::default()
    }
}

#[test]
fn misbehaving_pixels_are_classified_and_fall_back_to_the_unmasked_average() {
    let geometry = geometry();
    let mut rng = StdRng::seed_from_u64(42);
    let mut builder = DarkRampBuilder::new(&geometry, times(), config());
    let active = PixelMasks::from_geometry(&geometry).active_count();
    for _ in 0..5 {
        let counts = builder.accumulate(ramp(&mut rng)).expect("accumulate");
        assert_eq!(counts.poly + counts.deviant + counts.negative + counts.other, active);
        assert!(counts.deviant >= 1 && counts.negative >= 1, "{counts:?}");
        assert!(counts.poly as f64 >= 0.85 * active as f64, "{counts:?}");
    }
    let products = builder.finish().expect("finish");

    for ramp_index in 0..5 {
        assert_eq!(
            products.classification.class_at(ramp_index, RISING.0, RISING.1),
            Some(PixelClass::Deviant)
        );
        assert_eq!(
            products.classification.class_at(ramp_index, FALLING.0, FALLING.1),
            Some(PixelClass::Negative)
        );
    }
    assert_eq!(products.good_count[RISING], 0);
    assert!(!products.masked_path[RISING]);
    assert!(!products.masked_path[FALLING]);
    // Reference pixels always count as good.
    assert_eq!(products.good_count[(0, 0)], 5);
    assert!(products.masked_path[(0, 0)]);
}

#[test]
fn constant_offsets_move_into_the_bias_offset_image() {
    let geometry = geometry();
    let mut rng = StdRng::seed_from_u64(3);
    let mut builder = DarkRampBuilder::new(&geometry, times(), config());
    for _ in 0..5 {
        builder.accumulate(ramp(&mut rng)).expect("accumulate");
    }
    let products = builder.finish().expect("finish");

    assert!((products.bias_offset[OFFSET] - 20_000.0).abs() < 5.0, "{}", products.bias_offset[OFFSET]);
    let first = products.super_dark_ramp[(0, OFFSET.0, OFFSET.1)];
    assert!((first - RATE * 10.0).abs() < 4.0, "{first}");

    let slope = dark_slope_image(&products.super_dark_ramp, &times(), 1).expect("slope");
    assert!((slope[OFFSET] - RATE).abs() < 0.05, "{}", slope[OFFSET]);
    assert!((slope[(4, 4)] - RATE).abs() < 0.05, "{}", slope[(4, 4)]);
}
