//! Stage configuration.
//!
//! Every struct deserializes with missing fields filled from `Default`, so a
//! pipeline JSON only needs to name what differs from the defaults.

use super::constants::{
    CHI_SQUARE_CUTOFF, COLUMN_EDGE_EXCLUSION, COVERAGE_FRACTION, DARK_BACKGROUND_FILTER_SIZE,
    DEVIANT_SIGMA, PINK_FRAME_LIMIT, SATURATION_LEVEL_DN, SAVGOL_ORDER, SAVGOL_WINDOW,
    ZERO_GROUP_FRAMES,
};
use crate::detector::{CorrectionOptions, DetectorGeometry, DetectorTiming, ReadoutPattern};
use crate::domain::{CalibError, CalibResult, Verbosity};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BiasConfig {
    pub fit_degree: usize,
    /// Worker threads for the per-ramp fits; `<= 1` runs sequentially.
    pub worker_count: usize,
    pub correction: CorrectionOptions,
    pub verbosity: Verbosity,
}

impl Default for BiasConfig {
    fn default() -> Self {
        Self {
            fit_degree: 1,
            worker_count: 3,
            correction: CorrectionOptions::default(),
            verbosity: Verbosity::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DarkRampConfig {
    pub chi_square_cutoff: f64,
    pub coverage_fraction: f64,
    pub deviant_sigma: f64,
    /// A ramp with any sample at or above this level is classified `other`.
    pub saturation_level: f64,
    pub zero_group_frames: usize,
    /// Degree of the fit that turns the dark ramp into a slope image.
    pub slope_degree: usize,
    pub correction: CorrectionOptions,
    pub verbosity: Verbosity,
}

impl Default for DarkRampConfig {
    fn default() -> Self {
        Self {
            chi_square_cutoff: CHI_SQUARE_CUTOFF,
            coverage_fraction: COVERAGE_FRACTION,
            deviant_sigma: DEVIANT_SIGMA,
            saturation_level: SATURATION_LEVEL_DN,
            zero_group_frames: ZERO_GROUP_FRAMES,
            slope_degree: 1,
            correction: CorrectionOptions::default(),
            verbosity: Verbosity::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub box_size: usize,
    pub low_cut: f64,
    pub high_cut: f64,
    pub edge_margin: usize,
    /// Every `stride`-th difference image is sampled.
    pub stride: usize,
    /// Subtract the median-filtered super dark from every difference image.
    pub background_remove: bool,
    pub background_filter_size: usize,
    /// Subtract the median of each cutout's box edges before normalizing.
    pub box_background_remove: bool,
    pub compute_ppc: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            box_size: 5,
            low_cut: 5000.0,
            high_cut: 50_000.0,
            edge_margin: 4,
            stride: 4,
            background_remove: true,
            background_filter_size: DARK_BACKGROUND_FILTER_SIZE,
            box_background_remove: false,
            compute_ppc: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CdsPairing {
    /// `f[2k+1] - f[2k]`, non-overlapping.
    #[default]
    Alternating,
    /// `f[k+1] - f[k]`.
    Consecutive,
    /// `f[k] - f[0]` for `k >= 1`.
    FirstFrame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoiseEstimator {
    #[default]
    Spatial,
    Temporal,
    /// Mean of the spatial and temporal values.
    Average,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseConfig {
    pub pairing: CdsPairing,
    pub pink_frame_limit: usize,
    pub outlier_rejection: bool,
    pub savgol_window: usize,
    pub savgol_order: usize,
    pub estimator: NoiseEstimator,
    /// Restrict the active pool to pixels classified `poly` in the dark ramp.
    pub use_goodness_mask: bool,
    pub correction: CorrectionOptions,
    pub verbosity: Verbosity,
}

impl Default for NoiseConfig {
    fn default() -> Self {
        Self {
            pairing: CdsPairing::Alternating,
            pink_frame_limit: PINK_FRAME_LIMIT,
            outlier_rejection: true,
            savgol_window: SAVGOL_WINDOW,
            savgol_order: SAVGOL_ORDER,
            estimator: NoiseEstimator::Spatial,
            use_goodness_mask: true,
            correction: CorrectionOptions::default().with_fix_columns(false),
            verbosity: Verbosity::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpectrumMode {
    /// Each frame flattened in readout order; frequencies up to the pixel rate.
    #[default]
    Frame,
    /// Each pixel's series along the frame axis.
    Pixel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerSpectrumConfig {
    pub mode: SpectrumMode,
    pub cds: bool,
    pub include_overhead: bool,
    pub pad_power_of_two: bool,
    pub correlated: bool,
    pub uncorrelated: bool,
    pub band_low: [f64; 2],
    pub band_high: [f64; 2],
    pub cut_low: f64,
    pub cut_high: f64,
    pub alpha: f64,
    pub correction: CorrectionOptions,
    pub verbosity: Verbosity,
}

impl Default for PowerSpectrumConfig {
    fn default() -> Self {
        Self {
            mode: SpectrumMode::Frame,
            cds: true,
            include_overhead: false,
            pad_power_of_two: false,
            correlated: true,
            uncorrelated: true,
            band_low: [0.0, 1.0],
            band_high: [10.0, 100.0],
            cut_low: 1.0,
            cut_high: 10.0,
            alpha: -1.0,
            correction: CorrectionOptions::default().with_fix_columns(false),
            verbosity: Verbosity::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectiveNoiseConfig {
    pub patterns: Vec<ReadoutPattern>,
    /// Explicit group counts; derived from the ramp length when absent.
    pub group_counts: Option<Vec<usize>>,
    pub spatial: bool,
    pub temporal: bool,
    pub deconvolve: bool,
    pub initial_excess: [f64; 2],
    pub correction: CorrectionOptions,
    pub verbosity: Verbosity,
}

impl Default for EffectiveNoiseConfig {
    fn default() -> Self {
        Self {
            patterns: vec![ReadoutPattern::new("RAPID", 1, 0)],
            group_counts: None,
            spatial: true,
            temporal: true,
            deconvolve: true,
            initial_excess: [1.5, 10.0],
            correction: CorrectionOptions::default(),
            verbosity: Verbosity::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnVariationConfig {
    pub edge_exclusion: usize,
    pub correction: CorrectionOptions,
    pub verbosity: Verbosity,
}

impl Default for ColumnVariationConfig {
    fn default() -> Self {
        Self {
            edge_exclusion: COLUMN_EDGE_EXCLUSION,
            correction: CorrectionOptions::default(),
            verbosity: Verbosity::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferencePixelConfig {
    pub correction: CorrectionOptions,
    pub verbosity: Verbosity,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub geometry: DetectorGeometry,
    pub timing: DetectorTiming,
    pub bias: BiasConfig,
    pub dark: DarkRampConfig,
    pub kernel: KernelConfig,
    pub noise: NoiseConfig,
    pub power_spectrum: PowerSpectrumConfig,
    pub effective_noise: EffectiveNoiseConfig,
    pub columns: ColumnVariationConfig,
    pub reference: ReferencePixelConfig,
}

impl PipelineConfig {
    pub fn from_json_str(text: &str) -> CalibResult<Self> {
        let config: Self = serde_json::from_str(text).map_err(|error| {
            CalibError::invalid_configuration(
                "CONFIG.PARSE",
                format!("pipeline configuration is not valid JSON: {error}"),
            )
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_pretty(&self) -> CalibResult<String> {
        serde_json::to_string_pretty(self).map_err(|error| {
            CalibError::internal("SYS.CONFIG_SERIALIZE", error.to_string())
        })
    }

    pub fn validate(&self) -> CalibResult<()> {
        self.geometry.validate()?;
        self.timing.validate()?;

        if !(self.dark.coverage_fraction > 0.0 && self.dark.coverage_fraction <= 1.0) {
            return Err(CalibError::invalid_configuration(
                "CONFIG.DARK_COVERAGE",
                format!(
                    "coverage fraction must lie in (0, 1], got {}",
                    self.dark.coverage_fraction
                ),
            ));
        }
        if !(self.dark.saturation_level > 0.0) {
            return Err(CalibError::invalid_configuration(
                "CONFIG.DARK_SATURATION",
                format!(
                    "saturation level must be positive, got {}",
                    self.dark.saturation_level
                ),
            ));
        }
        if self.kernel.box_size < 3 || self.kernel.stride == 0 {
            return Err(CalibError::invalid_configuration(
                "CONFIG.KERNEL_BOX",
                format!(
                    "kernel box size must be >= 3 and stride >= 1, got {} and {}",
                    self.kernel.box_size, self.kernel.stride
                ),
            ));
        }
        if self.kernel.low_cut >= self.kernel.high_cut {
            return Err(CalibError::invalid_configuration(
                "CONFIG.KERNEL_CUTS",
                format!(
                    "kernel low cut {} must be below high cut {}",
                    self.kernel.low_cut, self.kernel.high_cut
                ),
            ));
        }
        if self.noise.savgol_window % 2 == 0 || self.noise.savgol_order >= self.noise.savgol_window
        {
            return Err(CalibError::invalid_configuration(
                "CONFIG.NOISE_SAVGOL",
                format!(
                    "Savitzky-Golay window {} must be odd and exceed order {}",
                    self.noise.savgol_window, self.noise.savgol_order
                ),
            ));
        }
        if self.effective_noise.patterns.is_empty() {
            return Err(CalibError::invalid_configuration(
                "CONFIG.EFFECTIVE_NOISE_PATTERNS",
                "effective noise needs at least one readout pattern",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{CdsPairing, NoiseEstimator, PipelineConfig};
    use crate::domain::CalibErrorCategory;

    #[test]
    fn empty_json_yields_defaults() {
        let config = PipelineConfig::from_json_str("{}").expect("defaults validate");
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.noise.pairing, CdsPairing::Alternating);
        assert!(!config.noise.correction.fix_columns);
        assert!(config.bias.correction.fix_columns);
    }

    #[test]
    fn partial_json_overrides_named_fields_only() {
        let config = PipelineConfig::from_json_str(
            r#"{
                "geometry": {"rows": 64, "cols": 64, "channel_count": 4, "channel_width": 16,
                             "borders": {"bottom": 4, "top": 4, "left": 4, "right": 4}},
                "kernel": {"compute_ppc": true},
                "noise": {"estimator": "average"}
            }"#,
        )
        .expect("valid config");
        assert_eq!(config.geometry.rows, 64);
        assert!(config.kernel.compute_ppc);
        assert_eq!(config.kernel.box_size, 5);
        assert_eq!(config.noise.estimator, NoiseEstimator::Average);
    }

    #[test]
    fn inconsistent_channel_tiling_is_rejected() {
        let error = PipelineConfig::from_json_str(
            r#"{"geometry": {"rows": 64, "cols": 64, "channel_count": 4, "channel_width": 10}}"#,
        )
        .expect_err("bad tiling");
        assert_eq!(error.category(), CalibErrorCategory::InvalidConfiguration);
        assert_eq!(error.placeholder(), "CONFIG.GEOMETRY_CHANNELS");
    }

    #[test]
    fn malformed_json_is_parse_error() {
        let error = PipelineConfig::from_json_str("{").expect_err("parse");
        assert_eq!(error.placeholder(), "CONFIG.PARSE");
    }
}
