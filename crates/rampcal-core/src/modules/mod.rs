pub mod bias;
pub mod columns;
pub mod dark;
pub mod excess;
pub mod kernel;
pub mod noise;
pub mod reference;

pub use bias::{KtcNoise, SuperBias, build_super_bias, ktc_noise};
pub use columns::{ColumnVariationAccumulator, ColumnVariations};
pub use dark::{
    ClassificationStack, DarkRampAverages, DarkRampBuilder, DarkRampProducts, PixelClass,
    PixelClassCounts, ZeroGroupFit, channel_ramp_averages, dark_slope_image, zero_group_offset,
};
pub use excess::{
    EffectiveNoiseAccumulator, EffectiveNoiseCurve, ExcessVarianceFit, default_group_counts,
    fit_excess_variance, resample_ramp,
};
pub use kernel::{
    CouplingKernel, CouplingKernels, DeconvolvedSupers, KernelDeconvolver, deconvolve_supers,
    estimate_kernels,
};
pub use reference::{ReferencePixelAccumulator, ReferencePixelSummary};
