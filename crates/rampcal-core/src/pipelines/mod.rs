//! Calibration session.
//!
//! Each stage streams the ramp source once and returns an immutable result;
//! later stages borrow the results they depend on. Nothing is cached on the
//! session itself, so rerunning a stage recomputes it from the source.

use crate::common::PipelineConfig;
use crate::common::constants::{KTC_ACTIVE_BIN_DN, KTC_REFERENCE_BIN_DN};
use crate::detector::{PixelMasks, RampSource, RampStream, ReferenceCorrector, masked_values};
use crate::domain::{CalibError, CalibErrorCategory, CalibResult, CalibrationStage};
use crate::modules::noise::{
    CdsNoiseSummary, NoiseComponent, NoiseComponentDict, NoiseDecomposer, NoiseSpectrumModel,
    PixelPool, PowerSpectrum, PowerSpectrumAccumulator,
};
use crate::modules::{
    ColumnVariationAccumulator, ColumnVariations, CouplingKernels, DarkRampAverages,
    DarkRampBuilder, DarkRampProducts, DeconvolvedSupers, EffectiveNoiseAccumulator,
    EffectiveNoiseCurve, ExcessVarianceFit, KernelDeconvolver, KtcNoise,
    ReferencePixelAccumulator, ReferencePixelSummary, SuperBias, build_super_bias,
    channel_ramp_averages, dark_slope_image, deconvolve_supers, estimate_kernels,
    fit_excess_variance, ktc_noise,
};
use ndarray::Axis;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq)]
pub struct BiasStage {
    pub super_bias: SuperBias,
    /// Reset noise of the active pixels.
    pub ktc: Option<KtcNoise>,
    pub ktc_reference: Option<KtcNoise>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DarkStage {
    pub products: DarkRampProducts,
    /// Super bias with the dark-ramp bias offset folded in.
    pub super_bias: SuperBias,
    /// Dark-current rate image, DN/s.
    pub super_dark: ndarray::Array2<f64>,
    pub averages: DarkRampAverages,
    /// Group times of the super dark ramp.
    pub times: Vec<f64>,
    /// Mean channel dark current, e-/s.
    pub dark_current: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NoiseStage {
    pub dict: NoiseComponentDict,
    pub summary: CdsNoiseSummary,
    pub spectrum: PowerSpectrum,
    /// Absent when the spectrum has no bins inside the fit bands.
    pub model: Option<NoiseSpectrumModel>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExcessStage {
    pub curves: Vec<EffectiveNoiseCurve>,
    pub fit: ExcessVarianceFit,
}

/// Headline numbers of a full run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibrationReport {
    pub ramps: usize,
    pub ktc_noise: Option<KtcNoise>,
    pub ktc_noise_reference: Option<KtcNoise>,
    /// e-/s.
    pub dark_current: f64,
    /// Pixels whose super dark ramp fell back to the unmasked average.
    pub fallback_pixels: usize,
    /// `[fraction, sigma]` of the right-neighbor IPC leak.
    pub ipc: Option<[f64; 2]>,
    pub ppc: Option<[f64; 2]>,
    pub noise: CdsNoiseSummary,
    pub correlated_scales: Option<[f64; 2]>,
    pub excess: ExcessVarianceFit,
    pub reference: Option<ReferencePixelSummary>,
    pub column_probability: f64,
    pub column_outliers: usize,
}

impl CalibrationReport {
    pub fn from_stages(
        bias: &BiasStage,
        dark: &DarkStage,
        kernels: Option<&CouplingKernels>,
        noise: &NoiseStage,
        excess: &ExcessStage,
        reference: Option<ReferencePixelSummary>,
        columns: &ColumnVariations,
    ) -> Self {
        let fraction = |(value, sigma): (f64, f64)| [value, sigma];
        Self {
            ramps: dark.products.ensemble_size,
            ktc_noise: bias.ktc,
            ktc_noise_reference: bias.ktc_reference,
            dark_current: dark.dark_current,
            fallback_pixels: dark.products.masked_path.iter().filter(|flag| !**flag).count(),
            ipc: kernels.map(|kernels| fraction(kernels.ipc.coupling_fraction())),
            ppc: kernels
                .and_then(|kernels| kernels.ppc.as_ref())
                .map(|ppc| fraction(ppc.coupling_fraction())),
            noise: noise.summary.clone(),
            correlated_scales: noise.model.as_ref().map(|model| model.correlated_scales),
            excess: excess.fit,
            reference,
            column_probability: columns.probability,
            column_outliers: columns.outlier_counts.iter().sum(),
        }
    }
}

pub struct CalibrationSession {
    config: PipelineConfig,
    masks: PixelMasks,
}

impl CalibrationSession {
    pub fn new(config: PipelineConfig) -> CalibResult<Self> {
        config.validate()?;
        let masks = PixelMasks::from_geometry(&config.geometry);
        Ok(Self { config, masks })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn run_super_bias(
        &self,
        source: &dyn RampSource,
        corrector: &dyn ReferenceCorrector,
    ) -> CalibResult<BiasStage> {
        let super_bias = build_super_bias(source, corrector, &self.config.timing, &self.config.bias)?;
        let active = masked_values(super_bias.sigma.view(), &self.masks.active);
        let reference = masked_values(super_bias.sigma.view(), &self.masks.reference);
        let ktc = ktc_noise(&active, KTC_ACTIVE_BIN_DN);
        let ktc_reference = ktc_noise(&reference, KTC_REFERENCE_BIN_DN);
        if let Some(noise) = ktc {
            tracing::info!(
                stage = %CalibrationStage::SuperBias,
                peak = noise.peak,
                spread = noise.spread,
                "kTC noise of active pixels"
            );
        }
        Ok(BiasStage {
            super_bias,
            ktc,
            ktc_reference,
        })
    }

    pub fn run_dark_ramp(
        &self,
        source: &dyn RampSource,
        corrector: &dyn ReferenceCorrector,
        super_bias: &SuperBias,
    ) -> CalibResult<DarkStage> {
        let geometry = &self.config.geometry;
        let stream = RampStream::new(source, corrector, self.config.dark.correction)
            .with_bias(&super_bias.mean);
        let mut builder: Option<DarkRampBuilder> = None;
        for ramp in stream {
            let ramp = ramp?;
            let builder = builder.get_or_insert_with(|| {
                let times = self.config.timing.time_axis(ramp.len_of(Axis(0)));
                DarkRampBuilder::new(geometry, times, self.config.dark.clone())
            });
            builder.accumulate(ramp)?;
        }
        let builder = builder.ok_or_else(|| {
            CalibError::invalid_configuration("CONFIG.EMPTY_SOURCE", "dark ramp needs at least one ramp")
        })?;
        let products = builder.finish()?;

        let times = self
            .config
            .timing
            .time_axis(products.super_dark_ramp.len_of(Axis(0)));
        let super_dark =
            dark_slope_image(&products.super_dark_ramp, &times, self.config.dark.slope_degree)?;
        let averages = channel_ramp_averages(&products.super_dark_ramp, geometry);
        let dark_current = averages.mean_dark_current(&times, self.config.timing.gain)?;
        tracing::info!(
            stage = %CalibrationStage::DarkRamp,
            dark_current,
            "mean dark current (e-/s)"
        );
        Ok(DarkStage {
            super_bias: super_bias.updated(&products.bias_offset),
            products,
            super_dark,
            averages,
            times,
            dark_current,
        })
    }

    /// `None` means too few isolated hot pixels; later stages skip deconvolution.
    pub fn run_kernels(&self, dark: &DarkStage) -> CalibResult<Option<CouplingKernels>> {
        let kernels = estimate_kernels(
            &dark.products.super_dark_ramp,
            &dark.super_dark,
            &dark.times,
            &self.config.geometry,
            &self.config.kernel,
        )?;
        if kernels.is_none() {
            tracing::warn!(
                stage = %CalibrationStage::Kernels,
                "no coupling kernels; continuing without deconvolution"
            );
        }
        Ok(kernels)
    }

    pub fn run_deconvolved_supers(
        &self,
        dark: &DarkStage,
        kernels: &CouplingKernels,
    ) -> CalibResult<DeconvolvedSupers> {
        deconvolve_supers(
            &dark.super_bias.mean,
            &dark.super_dark,
            kernels,
            &self.config.geometry,
        )
    }

    pub fn run_noise(
        &self,
        source: &dyn RampSource,
        corrector: &dyn ReferenceCorrector,
        dark: &DarkStage,
    ) -> CalibResult<NoiseStage> {
        let geometry = &self.config.geometry;
        let noise_config = &self.config.noise;
        let spectrum_config = &self.config.power_spectrum;
        let mut decomposer = NoiseDecomposer::new(geometry, noise_config.clone())?;
        let mut spectra =
            PowerSpectrumAccumulator::new(geometry, &self.config.timing, spectrum_config.clone())?;

        let stream = RampStream::uncorrected(source).with_bias(&dark.super_bias.mean);
        let classification = &dark.products.classification;
        let per_ramp_goodness = classification.ramp_count() == stream.len();
        if !per_ramp_goodness {
            tracing::warn!(
                stage = %CalibrationStage::Noise,
                classified = classification.ramp_count(),
                ramps = stream.len(),
                "ramp count differs from the dark ensemble; goodness mask not applied"
            );
        }

        for (index, ramp) in stream.enumerate() {
            let ramp = ramp?;
            let total = corrector.correct(ramp.clone(), &noise_config.correction)?;
            let white =
                corrector.correct(ramp.clone(), &noise_config.correction.with_fix_columns(true))?;
            let spectral = corrector.correct(ramp, &spectrum_config.correction)?;
            let goodness = per_ramp_goodness
                .then(|| classification.poly.index_axis(Axis(0), index).to_owned());
            decomposer.accumulate(&total, &white, goodness.as_ref())?;
            spectra.accumulate(&spectral)?;
        }

        let dict = decomposer.finish();
        let summary = dict.summary(noise_config.estimator)?;
        let spectrum = spectra.finish()?;

        let white = dict.rms(NoiseComponent::White, PixelPool::Active);
        let uncorrelated = dict.rms(NoiseComponent::UncorrelatedPink, PixelPool::Active);
        let model = match (white, uncorrelated) {
            (Some(white), Some(uncorrelated)) => match NoiseSpectrumModel::from_components(
                &spectrum.frequencies,
                &spectrum.channel_mean(),
                white,
                uncorrelated,
                summary.pink_correlated,
                spectrum_config,
            ) {
                Ok(model) => Some(model),
                Err(error) if error.category() == CalibErrorCategory::NumericDegeneracy => {
                    tracing::warn!(
                        stage = %CalibrationStage::PowerSpectrum,
                        error = %error,
                        "noise spectrum model skipped"
                    );
                    None
                }
                Err(error) => return Err(error),
            },
            _ => None,
        };

        Ok(NoiseStage {
            dict,
            summary,
            spectrum,
            model,
        })
    }

    /// One curve per configured readout pattern, all from a single pass.
    pub fn run_effective_noise(
        &self,
        source: &dyn RampSource,
        corrector: &dyn ReferenceCorrector,
        dark: &DarkStage,
        kernels: Option<&CouplingKernels>,
    ) -> CalibResult<Vec<EffectiveNoiseCurve>> {
        let geometry = &self.config.geometry;
        let config = &self.config.effective_noise;
        let deconvolver = match kernels {
            Some(kernels) if config.deconvolve => Some(KernelDeconvolver::new(kernels, geometry)?),
            _ => None,
        };

        let stream = RampStream::new(source, corrector, config.correction)
            .with_bias(&dark.super_bias.mean)
            .with_dark_ramp(&dark.products.super_dark_ramp);
        let mut accumulators: Vec<EffectiveNoiseAccumulator<'_>> = Vec::new();
        for ramp in stream {
            let ramp = ramp?;
            if accumulators.is_empty() {
                let frames = ramp.len_of(Axis(0));
                accumulators = config
                    .patterns
                    .iter()
                    .map(|pattern| {
                        EffectiveNoiseAccumulator::new(
                            geometry,
                            &self.config.timing,
                            pattern,
                            frames,
                            config,
                            deconvolver.as_ref(),
                        )
                    })
                    .collect::<CalibResult<Vec<_>>>()?;
            }
            for accumulator in &mut accumulators {
                accumulator.accumulate(&ramp)?;
            }
        }
        if accumulators.is_empty() {
            return Err(CalibError::invalid_configuration(
                "CONFIG.EMPTY_SOURCE",
                "effective noise needs at least one ramp",
            ));
        }
        accumulators
            .into_iter()
            .map(EffectiveNoiseAccumulator::finish)
            .collect()
    }

    /// A configured dark current or read noise overrides the measured one.
    pub fn run_excess(
        &self,
        curves: Vec<EffectiveNoiseCurve>,
        dark: &DarkStage,
    ) -> CalibResult<ExcessStage> {
        let timing = &self.config.timing;
        let fit = fit_excess_variance(
            &curves,
            timing,
            self.config.geometry.channel_count,
            timing.dark_current.or(Some(dark.dark_current)),
            timing.read_noise,
            self.config.effective_noise.initial_excess,
        )?;
        Ok(ExcessStage { curves, fit })
    }

    pub fn run_reference_summary(
        &self,
        source: &dyn RampSource,
        corrector: &dyn ReferenceCorrector,
        dark: &DarkStage,
    ) -> CalibResult<ReferencePixelSummary> {
        let mut accumulator = ReferencePixelAccumulator::new(
            &self.config.geometry,
            corrector,
            self.config.reference.clone(),
        )?;
        let stream = RampStream::uncorrected(source)
            .with_bias(&dark.super_bias.mean)
            .with_dark_ramp(&dark.products.super_dark_ramp);
        for ramp in stream {
            accumulator.accumulate(ramp?)?;
        }
        accumulator.finish()
    }

    pub fn run_column_variations(
        &self,
        source: &dyn RampSource,
        corrector: &dyn ReferenceCorrector,
        dark: &DarkStage,
    ) -> CalibResult<ColumnVariations> {
        let mut accumulator =
            ColumnVariationAccumulator::new(&self.config.geometry, self.config.columns.clone());
        let stream = RampStream::new(source, corrector, self.config.columns.correction)
            .with_bias(&dark.super_bias.mean)
            .with_dark_ramp(&dark.products.super_dark_ramp);
        for ramp in stream {
            accumulator.accumulate(&ramp?)?;
        }
        accumulator.finish()
    }

    /// Every stage in order. The reference summary runs only when the
    /// geometry has top or bottom reference rows.
    pub fn run_all(
        &self,
        source: &dyn RampSource,
        corrector: &dyn ReferenceCorrector,
    ) -> CalibResult<CalibrationReport> {
        let bias = self.run_super_bias(source, corrector)?;
        let dark = self.run_dark_ramp(source, corrector, &bias.super_bias)?;
        let kernels = self.run_kernels(&dark)?;
        let noise = self.run_noise(source, corrector, &dark)?;
        let curves = self.run_effective_noise(source, corrector, &dark, kernels.as_ref())?;
        let excess = self.run_excess(curves, &dark)?;
        let borders = self.config.geometry.borders;
        let reference = if borders.top + borders.bottom > 0 {
            Some(self.run_reference_summary(source, corrector, &dark)?)
        } else {
            None
        };
        let columns = self.run_column_variations(source, corrector, &dark)?;
        Ok(CalibrationReport::from_stages(
            &bias,
            &dark,
            kernels.as_ref(),
            &noise,
            &excess,
            reference,
            &columns,
        ))
    }
}
