//! Read-noise decomposition and power spectra.

pub mod cds;
pub mod decomposer;
pub mod one_over_f;
pub mod spectrum;

pub use cds::{CdsNoise, cds_noise, cds_pairs, pool_series};
pub use decomposer::{
    CdsEstimator, CdsNoiseSummary, NoiseComponent, NoiseComponentDict, NoiseDecomposer, NoiseKey,
    PixelPool,
};
pub use one_over_f::{FixedPatternExtractor, split_correlated};
pub use spectrum::{
    NoiseSpectrumModel, PowerSpectrum, PowerSpectrumAccumulator, broken_power_law,
    fit_correlated_power_law, prepare_spectrum_cube,
};
