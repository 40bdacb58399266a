pub mod config;
pub mod constants;

pub use config::{
    BiasConfig, CdsPairing, ColumnVariationConfig, DarkRampConfig, EffectiveNoiseConfig,
    KernelConfig, NoiseConfig, NoiseEstimator, PipelineConfig, PowerSpectrumConfig,
    ReferencePixelConfig, SpectrumMode,
};
