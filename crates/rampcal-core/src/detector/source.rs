//! Seams to the outside world: where ramps come from and how reference pixels
//! are corrected before the calibration stages see them.

use super::geometry::DetectorGeometry;
use crate::domain::{CalibError, CalibResult};
use crate::numerics::{SavGolFilter, mean, median};
use ndarray::{Array2, Array3, Axis, s};
use serde::{Deserialize, Serialize};

/// One integration inside one container (file, buffer, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RampUnit {
    pub container: usize,
    pub integration: usize,
}

pub trait RampSource: Sync {
    fn units(&self) -> Vec<RampUnit>;

    fn integration_count(&self, container: usize) -> CalibResult<usize>;

    /// Raw `[frames, rows, cols]` cube in DN.
    fn load(&self, unit: RampUnit) -> CalibResult<Array3<f64>>;
}

pub fn check_integration_index(unit: RampUnit, available: usize) -> CalibResult<()> {
    if unit.integration >= available {
        return Err(CalibError::invalid_configuration(
            "CONFIG.INTEGRATION_INDEX",
            format!(
                "integration {} requested but container {} holds {}",
                unit.integration, unit.container, available
            ),
        ));
    }
    Ok(())
}

/// Ramps already resident in memory, grouped by container.
#[derive(Debug, Clone, Default)]
pub struct MemoryRampSource {
    containers: Vec<Vec<Array3<f64>>>,
}

impl MemoryRampSource {
    pub fn new(containers: Vec<Vec<Array3<f64>>>) -> Self {
        Self { containers }
    }

    /// One container per ramp.
    pub fn from_ramps(ramps: Vec<Array3<f64>>) -> Self {
        Self::new(ramps.into_iter().map(|ramp| vec![ramp]).collect())
    }

    pub fn len(&self) -> usize {
        self.containers.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RampSource for MemoryRampSource {
    fn units(&self) -> Vec<RampUnit> {
        self.containers
            .iter()
            .enumerate()
            .flat_map(|(container, ramps)| {
                (0..ramps.len()).map(move |integration| RampUnit {
                    container,
                    integration,
                })
            })
            .collect()
    }

    fn integration_count(&self, container: usize) -> CalibResult<usize> {
        self.containers
            .get(container)
            .map(Vec::len)
            .ok_or_else(|| {
                CalibError::invalid_configuration(
                    "CONFIG.CONTAINER_INDEX",
                    format!(
                        "container {} requested but only {} exist",
                        container,
                        self.containers.len()
                    ),
                )
            })
    }

    fn load(&self, unit: RampUnit) -> CalibResult<Array3<f64>> {
        let available = self.integration_count(unit.container)?;
        check_integration_index(unit, available)?;
        Ok(self.containers[unit.container][unit.integration].clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AveragingMode {
    /// Reference level per frame.
    #[default]
    Pixel,
    /// Reference level per frame, from the frame-median of the reference rows.
    Frame,
    /// One reference level per channel for the whole integration.
    Integration,
}

/// Options understood by a [`ReferenceCorrector`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrectionOptions {
    pub channel_count: usize,
    /// Separate levels for even and odd columns.
    pub alternating_column_mode: bool,
    pub in_place: bool,
    /// Remove the row-wise side-reference pattern.
    pub fix_columns: bool,
    pub averaging_mode: AveragingMode,
    pub smoothing_enabled: bool,
    pub per_integration: bool,
}

impl Default for CorrectionOptions {
    fn default() -> Self {
        Self {
            channel_count: 4,
            alternating_column_mode: true,
            in_place: true,
            fix_columns: true,
            averaging_mode: AveragingMode::Pixel,
            smoothing_enabled: true,
            per_integration: false,
        }
    }
}

impl CorrectionOptions {
    pub fn with_fix_columns(mut self, fix_columns: bool) -> Self {
        self.fix_columns = fix_columns;
        self
    }
}

/// Reference-pixel correction `cube -> cube'`, treated as a black box.
pub trait ReferenceCorrector: Sync {
    fn correct(&self, cube: Array3<f64>, options: &CorrectionOptions) -> CalibResult<Array3<f64>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityCorrector;

impl ReferenceCorrector for IdentityCorrector {
    fn correct(&self, cube: Array3<f64>, _options: &CorrectionOptions) -> CalibResult<Array3<f64>> {
        Ok(cube)
    }
}

/// Per-channel offset removal from the top/bottom reference rows, with an
/// optional row-wise fix from the left/right reference columns.
#[derive(Debug, Clone, Copy)]
pub struct ChannelOffsetCorrector {
    geometry: DetectorGeometry,
}

impl ChannelOffsetCorrector {
    pub fn new(geometry: DetectorGeometry) -> Self {
        Self { geometry }
    }

    fn channel_levels(&self, cube: &Array3<f64>, options: &CorrectionOptions) -> Array3<f64> {
        let (frames, _, _) = cube.dim();
        let geometry = &self.geometry;
        let channels = options.channel_count.min(geometry.channel_count).max(1);
        let width = geometry.cols / channels;
        let b = geometry.borders;
        let rows: Vec<usize> = (0..b.bottom)
            .chain((geometry.rows - b.top)..geometry.rows)
            .collect();
        let parities = if options.alternating_column_mode { 2 } else { 1 };

        // [frame, channel, parity]
        let mut levels = Array3::<f64>::zeros((frames, channels, parities));
        if rows.is_empty() {
            return levels;
        }
        for frame in 0..frames {
            for channel in 0..channels {
                for parity in 0..parities {
                    let values: Vec<f64> = rows
                        .iter()
                        .flat_map(|row| {
                            (channel * width..(channel + 1) * width)
                                .filter(move |col| parities == 1 || col % 2 == parity)
                                .map(move |col| cube[(frame, *row, col)])
                        })
                        .collect();
                    let level = match options.averaging_mode {
                        AveragingMode::Frame => median(&values),
                        AveragingMode::Pixel | AveragingMode::Integration => mean(&values),
                    };
                    levels[(frame, channel, parity)] = level.unwrap_or(0.0);
                }
            }
        }

        if options.averaging_mode == AveragingMode::Integration {
            let averaged = levels.mean_axis(Axis(0));
            if let Some(averaged) = averaged {
                for mut frame in levels.axis_iter_mut(Axis(0)) {
                    frame.assign(&averaged);
                }
            }
        }
        levels
    }

    /// Row profile of the left/right reference columns of one frame.
    fn side_pattern(
        &self,
        frame: ndarray::ArrayView2<'_, f64>,
        options: &CorrectionOptions,
    ) -> CalibResult<Vec<f64>> {
        let b = self.geometry.borders;
        let cols = self.geometry.cols;
        let profile: Vec<f64> = frame
            .axis_iter(Axis(0))
            .map(|row| {
                let picked: Vec<f64> = (0..b.left)
                    .chain((cols - b.right)..cols)
                    .map(|col| row[col])
                    .collect();
                mean(&picked).unwrap_or(0.0)
            })
            .collect();

        if options.smoothing_enabled {
            Ok(SavGolFilter::new(31, 3)?.smooth(&profile)?)
        } else {
            Ok(profile)
        }
    }
}

impl ReferenceCorrector for ChannelOffsetCorrector {
    fn correct(&self, cube: Array3<f64>, options: &CorrectionOptions) -> CalibResult<Array3<f64>> {
        let (_, rows, cols) = cube.dim();
        if (rows, cols) != self.geometry.shape() {
            return Err(CalibError::invalid_configuration(
                "CONFIG.CUBE_SHAPE",
                format!(
                    "cube frames are {rows}x{cols} but the detector is {}x{}",
                    self.geometry.rows, self.geometry.cols
                ),
            ));
        }

        let levels = self.channel_levels(&cube, options);
        let mut cube = cube;
        let channels = levels.dim().1;
        let parities = levels.dim().2;
        let width = cols / channels;
        for ((frame, _, col), value) in cube.indexed_iter_mut() {
            let channel = (col / width).min(channels - 1);
            let parity = if parities == 2 { col % 2 } else { 0 };
            *value -= levels[(frame, channel, parity)];
        }

        let b = self.geometry.borders;
        if options.fix_columns && b.left + b.right > 0 {
            for mut frame in cube.axis_iter_mut(Axis(0)) {
                let pattern = self.side_pattern(frame.view(), options)?;
                for (mut row, level) in frame.axis_iter_mut(Axis(0)).zip(pattern) {
                    row -= level;
                }
            }
        }
        Ok(cube)
    }
}

/// Loads units one at a time and hands out owned, prepared cubes.
///
/// Preparation order: subtract the bias image, subtract the leading frames of
/// a dark ramp, apply the corrector.
pub struct RampStream<'a> {
    source: &'a dyn RampSource,
    corrector: Option<&'a dyn ReferenceCorrector>,
    options: CorrectionOptions,
    bias: Option<&'a Array2<f64>>,
    dark_ramp: Option<&'a Array3<f64>>,
    units: Vec<RampUnit>,
    next: usize,
}

impl<'a> RampStream<'a> {
    pub fn new(
        source: &'a dyn RampSource,
        corrector: &'a dyn ReferenceCorrector,
        options: CorrectionOptions,
    ) -> Self {
        Self {
            source,
            corrector: Some(corrector),
            options,
            bias: None,
            dark_ramp: None,
            units: source.units(),
            next: 0,
        }
    }

    /// Stream without reference correction.
    pub fn uncorrected(source: &'a dyn RampSource) -> Self {
        Self {
            source,
            corrector: None,
            options: CorrectionOptions::default(),
            bias: None,
            dark_ramp: None,
            units: source.units(),
            next: 0,
        }
    }

    pub fn with_bias(mut self, bias: &'a Array2<f64>) -> Self {
        self.bias = Some(bias);
        self
    }

    pub fn with_dark_ramp(mut self, dark_ramp: &'a Array3<f64>) -> Self {
        self.dark_ramp = Some(dark_ramp);
        self
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn prepare(&self, unit: RampUnit) -> CalibResult<Array3<f64>> {
        let mut cube = self.source.load(unit)?;
        let (frames, rows, cols) = cube.dim();
        if let Some(bias) = self.bias {
            if bias.dim() != (rows, cols) {
                return Err(shape_error("bias", bias.dim(), (rows, cols)));
            }
            for mut frame in cube.axis_iter_mut(Axis(0)) {
                frame -= bias;
            }
        }
        if let Some(dark) = self.dark_ramp {
            let (dark_frames, dark_rows, dark_cols) = dark.dim();
            if (dark_rows, dark_cols) != (rows, cols) {
                return Err(shape_error("dark ramp", (dark_rows, dark_cols), (rows, cols)));
            }
            let shared = frames.min(dark_frames);
            let mut head = cube.slice_mut(s![0..shared, .., ..]);
            head -= &dark.slice(s![0..shared, .., ..]);
        }
        match self.corrector {
            Some(corrector) => corrector.correct(cube, &self.options),
            None => Ok(cube),
        }
    }
}

impl Iterator for RampStream<'_> {
    type Item = CalibResult<Array3<f64>>;

    fn next(&mut self) -> Option<Self::Item> {
        let unit = *self.units.get(self.next)?;
        self.next += 1;
        Some(self.prepare(unit))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.units.len() - self.next;
        (remaining, Some(remaining))
    }
}

fn shape_error(what: &str, actual: (usize, usize), expected: (usize, usize)) -> CalibError {
    CalibError::invalid_configuration(
        "CONFIG.CUBE_SHAPE",
        format!(
            "{what} is {}x{} but ramp frames are {}x{}",
            actual.0, actual.1, expected.0, expected.1
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::{
        ChannelOffsetCorrector, CorrectionOptions, IdentityCorrector, MemoryRampSource,
        RampSource, RampStream, RampUnit, ReferenceCorrector,
    };
    use crate::detector::geometry::{DetectorGeometry, ReferenceBorders, ScanLayout};
    use crate::domain::CalibErrorCategory;
    use ndarray::{Array2, Array3};

    fn geometry() -> DetectorGeometry {
        DetectorGeometry {
            rows: 10,
            cols: 8,
            channel_count: 2,
            channel_width: 4,
            borders: ReferenceBorders {
                bottom: 2,
                top: 2,
                left: 0,
                right: 0,
            },
            scan_layout: ScanLayout::default(),
        }
    }

    #[test]
    fn loading_past_integration_count_is_configuration_error() {
        let source = MemoryRampSource::new(vec![vec![Array3::zeros((2, 2, 2)); 2]]);
        let error = source
            .load(RampUnit {
                container: 0,
                integration: 2,
            })
            .expect_err("out of range");
        assert_eq!(error.category(), CalibErrorCategory::InvalidConfiguration);
        assert_eq!(error.placeholder(), "CONFIG.INTEGRATION_INDEX");
        assert_eq!(source.units().len(), 2);
    }

    #[test]
    fn stream_subtracts_bias_before_correction() {
        let source = MemoryRampSource::from_ramps(vec![Array3::from_elem((3, 2, 2), 7.0)]);
        let bias = Array2::from_elem((2, 2), 5.0);
        let corrector = IdentityCorrector;
        let cubes: Vec<_> = RampStream::new(&source, &corrector, CorrectionOptions::default())
            .with_bias(&bias)
            .collect::<Result<_, _>>()
            .expect("stream");
        assert_eq!(cubes.len(), 1);
        assert!(cubes[0].iter().all(|value| (*value - 2.0).abs() < 1.0e-12));
    }

    #[test]
    fn channel_offsets_are_removed_per_channel() {
        let geometry = geometry();
        let cube = Array3::from_shape_fn((2, 10, 8), |(frame, _, col)| {
            if col < 4 { 100.0 + frame as f64 } else { -30.0 }
        });
        let corrected = ChannelOffsetCorrector::new(geometry)
            .correct(cube, &CorrectionOptions::default())
            .expect("corrected");
        assert!(corrected.iter().all(|value| value.abs() < 1.0e-9));
    }
}
