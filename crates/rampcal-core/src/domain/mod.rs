pub mod errors;

pub use errors::{CalibError, CalibErrorCategory, CalibResult, ExitMapping};

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CalibrationStage {
    SuperBias,
    DarkRamp,
    Kernels,
    Noise,
    PowerSpectrum,
    EffectiveNoise,
    ExcessVariance,
    ReferencePixels,
    ColumnVariations,
}

impl CalibrationStage {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SuperBias => "SUPER_BIAS",
            Self::DarkRamp => "DARK_RAMP",
            Self::Kernels => "KERNELS",
            Self::Noise => "NOISE",
            Self::PowerSpectrum => "POWER_SPECTRUM",
            Self::EffectiveNoise => "EFFECTIVE_NOISE",
            Self::ExcessVariance => "EXCESS_VARIANCE",
            Self::ReferencePixels => "REFERENCE_PIXELS",
            Self::ColumnVariations => "COLUMN_VARIATIONS",
        }
    }
}

impl Display for CalibrationStage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str((*self).as_str())
    }
}

/// Progress chatter level for streaming stages.
///
/// Stage boundaries are always logged at `info`; this only governs the
/// per-ramp events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verbosity {
    Quiet,
    #[default]
    Normal,
    Verbose,
}

impl Verbosity {
    pub fn ramp_progress(self, stage: CalibrationStage, index: usize, total: Option<usize>) {
        let total = total.map_or_else(|| "?".to_string(), |value| value.to_string());
        match self {
            Self::Quiet => {}
            Self::Normal => {
                tracing::debug!(stage = %stage, ramp = index + 1, total = %total, "ramp reduced")
            }
            Self::Verbose => {
                tracing::info!(stage = %stage, ramp = index + 1, total = %total, "ramp reduced")
            }
        }
    }
}
