pub mod geometry;
pub mod source;
pub mod timing;

pub use geometry::{
    DetectorGeometry, PixelMasks, ReferenceBorders, ScanDirection, ScanLayout, masked_values,
};
pub use source::{
    AveragingMode, ChannelOffsetCorrector, CorrectionOptions, IdentityCorrector,
    MemoryRampSource, RampSource, RampStream, RampUnit, ReferenceCorrector,
    check_integration_index,
};
pub use timing::{DetectorTiming, ReadoutPattern, excess_variance_model, theoretical_slope_noise};
