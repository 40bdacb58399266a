//! Numeric defaults shared by the calibration stages.

/// Reduced chi-square above which a linear ramp fit is refit with a quadratic.
pub const CHI_SQUARE_CUTOFF: f64 = 2.0;
/// Fraction of the ensemble a pixel must be `poly` in to use the masked average.
pub const COVERAGE_FRACTION: f64 = 0.75;
/// Floor for the per-pixel noise estimate used in reduced chi-square, in DN.
pub const NOISE_FLOOR_DN: f64 = 1.0e-6;
/// Robust sigmas beyond the slope median that mark a deviant pixel.
pub const DEVIANT_SIGMA: f64 = 5.0;
/// 16-bit ADC ceiling; ramps reaching it are not fit.
pub const SATURATION_LEVEL_DN: f64 = 65_535.0;

pub const ZERO_GROUP_FRAMES: usize = 15;
pub const ZERO_GROUP_FIT_RANGE: [usize; 2] = [0, 10];

/// First-frame level below which an averaged ramp needs its offset re-derived.
pub const NEGATIVE_FIRST_FRAME: f64 = 0.0;
pub const RC_FIRST_FRAME_LIMIT: f64 = 1000.0;
pub const RC_LAST_FRAME_LIMIT: f64 = 50_000.0;
pub const LARGE_OFFSET_LIMIT: f64 = 10_000.0;

pub const KERNEL_SPECTRUM_FLOOR: f64 = 1.0e-12;
pub const DARK_BACKGROUND_FILTER_SIZE: usize = 7;

pub const OUTLIER_MAD_FACTOR: f64 = 10.0;
pub const SAVGOL_WINDOW: usize = 31;
pub const SAVGOL_ORDER: usize = 3;
pub const PINK_FRAME_LIMIT: usize = 20;

pub const KTC_ACTIVE_BIN_DN: f64 = 0.25;
pub const KTC_REFERENCE_BIN_DN: f64 = 1.0;

pub const COLUMN_EDGE_EXCLUSION: usize = 4;

#[cfg(test)]
mod tests {
    use super::{
        CHI_SQUARE_CUTOFF, COVERAGE_FRACTION, LARGE_OFFSET_LIMIT, RC_FIRST_FRAME_LIMIT,
        RC_LAST_FRAME_LIMIT, SAVGOL_ORDER, SAVGOL_WINDOW,
    };

    #[test]
    fn thresholds_are_ordered() {
        assert!(CHI_SQUARE_CUTOFF > 1.0);
        assert!(COVERAGE_FRACTION > 0.5 && COVERAGE_FRACTION < 1.0);
        assert!(RC_FIRST_FRAME_LIMIT < LARGE_OFFSET_LIMIT);
        assert!(LARGE_OFFSET_LIMIT < RC_LAST_FRAME_LIMIT);
        assert!(SAVGOL_WINDOW % 2 == 1 && SAVGOL_ORDER < SAVGOL_WINDOW);
    }
}
