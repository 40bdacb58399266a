use crate::domain::{CalibError, CalibResult};
use ndarray::{Array2, ArrayView2, ArrayViewMut2, s};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Widths of the shielded reference-pixel frame, in pixels.
///
/// `bottom` counts rows from index 0 and `top` from the last row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReferenceBorders {
    pub bottom: usize,
    pub top: usize,
    pub left: usize,
    pub right: usize,
}

impl ReferenceBorders {
    pub const fn uniform(width: usize) -> Self {
        Self {
            bottom: width,
            top: width,
            left: width,
            right: width,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanDirection {
    Forward,
    /// Column-flipped relative to readout order.
    Reverse,
}

impl ScanDirection {
    pub const fn is_reversed(self) -> bool {
        matches!(self, Self::Reverse)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanLayout {
    pub same_scan_direction: bool,
    pub reverse_scan_direction: bool,
}

impl ScanLayout {
    pub const fn direction(self, channel: usize) -> ScanDirection {
        let reversed = if self.same_scan_direction || channel % 2 == 0 {
            self.reverse_scan_direction
        } else {
            !self.reverse_scan_direction
        };
        if reversed {
            ScanDirection::Reverse
        } else {
            ScanDirection::Forward
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectorGeometry {
    pub rows: usize,
    pub cols: usize,
    pub channel_count: usize,
    pub channel_width: usize,
    #[serde(default)]
    pub borders: ReferenceBorders,
    #[serde(default)]
    pub scan_layout: ScanLayout,
}

impl DetectorGeometry {
    /// Full-frame 2048² array with four 512-column channels and a 4-pixel border.
    pub const fn full_frame() -> Self {
        Self {
            rows: 2048,
            cols: 2048,
            channel_count: 4,
            channel_width: 512,
            borders: ReferenceBorders::uniform(4),
            scan_layout: ScanLayout {
                same_scan_direction: false,
                reverse_scan_direction: false,
            },
        }
    }

    pub fn validate(&self) -> CalibResult<()> {
        if self.rows == 0 || self.cols == 0 {
            return Err(CalibError::invalid_configuration(
                "CONFIG.GEOMETRY_SHAPE",
                format!("detector shape {}x{} is empty", self.rows, self.cols),
            ));
        }
        if self.channel_count == 0 || self.channel_count * self.channel_width != self.cols {
            return Err(CalibError::invalid_configuration(
                "CONFIG.GEOMETRY_CHANNELS",
                format!(
                    "{} channels of width {} do not tile {} columns",
                    self.channel_count, self.channel_width, self.cols
                ),
            ));
        }
        let borders = self.borders;
        if borders.bottom + borders.top >= self.rows || borders.left + borders.right >= self.cols
        {
            return Err(CalibError::invalid_configuration(
                "CONFIG.GEOMETRY_BORDERS",
                format!(
                    "reference borders {:?} leave no active pixels in {}x{}",
                    borders, self.rows, self.cols
                ),
            ));
        }
        Ok(())
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn channel_columns(&self, channel: usize) -> Range<usize> {
        let start = channel * self.channel_width;
        start..(start + self.channel_width)
    }

    pub fn channel_of_column(&self, col: usize) -> usize {
        (col / self.channel_width.max(1)).min(self.channel_count.saturating_sub(1))
    }

    pub fn scan_direction(&self, channel: usize) -> ScanDirection {
        self.scan_layout.direction(channel)
    }

    pub fn is_reference(&self, row: usize, col: usize) -> bool {
        let b = self.borders;
        row < b.bottom
            || row + b.top >= self.rows
            || col < b.left
            || col + b.right >= self.cols
    }

    /// Copy of one channel's columns, flipped into readout order.
    pub fn channel_in_readout_order(&self, image: ArrayView2<'_, f64>, channel: usize) -> Array2<f64> {
        let slab = image.slice(s![.., self.channel_columns(channel)]);
        match self.scan_direction(channel) {
            ScanDirection::Forward => slab.to_owned(),
            ScanDirection::Reverse => slab.slice(s![.., ..;-1]).to_owned(),
        }
    }

    /// Write a readout-ordered channel slab back into detector orientation.
    pub fn store_channel(&self, mut image: ArrayViewMut2<'_, f64>, channel: usize, slab: &Array2<f64>) {
        let mut target = image.slice_mut(s![.., self.channel_columns(channel)]);
        match self.scan_direction(channel) {
            ScanDirection::Forward => target.assign(slab),
            ScanDirection::Reverse => target.assign(&slab.slice(s![.., ..;-1])),
        }
    }
}

impl Default for DetectorGeometry {
    fn default() -> Self {
        Self::full_frame()
    }
}

/// Boolean masks derived once from the geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelMasks {
    pub reference: Array2<bool>,
    pub active: Array2<bool>,
    /// Top and bottom reference rows only.
    pub reference_rows: Array2<bool>,
    pub channel_ids: Array2<usize>,
}

impl PixelMasks {
    pub fn from_geometry(geometry: &DetectorGeometry) -> Self {
        let shape = geometry.shape();
        let reference = Array2::from_shape_fn(shape, |(row, col)| geometry.is_reference(row, col));
        let active = reference.mapv(|flag| !flag);
        let b = geometry.borders;
        let reference_rows = Array2::from_shape_fn(shape, |(row, _)| {
            row < b.bottom || row + b.top >= geometry.rows
        });
        let channel_ids = Array2::from_shape_fn(shape, |(_, col)| geometry.channel_of_column(col));
        Self {
            reference,
            active,
            reference_rows,
            channel_ids,
        }
    }

    pub fn active_in_channel(&self, channel: usize) -> Array2<bool> {
        ndarray::Zip::from(&self.active)
            .and(&self.channel_ids)
            .map_collect(|active, id| *active && *id == channel)
    }

    pub fn reference_rows_in_channel(&self, channel: usize) -> Array2<bool> {
        ndarray::Zip::from(&self.reference_rows)
            .and(&self.channel_ids)
            .map_collect(|reference, id| *reference && *id == channel)
    }

    pub fn active_count(&self) -> usize {
        self.active.iter().filter(|flag| **flag).count()
    }
}

/// Values of `image` where `mask` is set, in row-major order.
pub fn masked_values(image: ArrayView2<'_, f64>, mask: &Array2<bool>) -> Vec<f64> {
    image
        .iter()
        .zip(mask.iter())
        .filter_map(|(value, keep)| keep.then_some(*value))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{DetectorGeometry, PixelMasks, ReferenceBorders, ScanDirection, ScanLayout};
    use crate::domain::CalibErrorCategory;
    use ndarray::Array2;

    fn small_geometry() -> DetectorGeometry {
        DetectorGeometry {
            rows: 8,
            cols: 12,
            channel_count: 3,
            channel_width: 4,
            borders: ReferenceBorders {
                bottom: 1,
                top: 2,
                left: 1,
                right: 1,
            },
            scan_layout: ScanLayout::default(),
        }
    }

    #[test]
    fn masks_partition_the_array() {
        let masks = PixelMasks::from_geometry(&small_geometry());
        for (reference, active) in masks.reference.iter().zip(masks.active.iter()) {
            assert_ne!(reference, active);
        }
        assert_eq!(masks.active_count(), 5 * 10);
        assert!(masks.reference[(6, 5)]);
        assert!(masks.reference_rows[(7, 5)]);
        assert!(!masks.reference_rows[(3, 0)]);
        assert_eq!(masks.channel_ids[(0, 9)], 2);
    }

    #[test]
    fn alternating_layout_flips_odd_channels() {
        let layout = ScanLayout {
            same_scan_direction: false,
            reverse_scan_direction: false,
        };
        assert_eq!(layout.direction(0), ScanDirection::Forward);
        assert_eq!(layout.direction(1), ScanDirection::Reverse);

        let same = ScanLayout {
            same_scan_direction: true,
            reverse_scan_direction: true,
        };
        assert_eq!(same.direction(1), ScanDirection::Reverse);
        assert_eq!(same.direction(2), ScanDirection::Reverse);
    }

    #[test]
    fn readout_order_round_trips_through_store() {
        let geometry = small_geometry();
        let image = Array2::from_shape_fn((8, 12), |(r, c)| (r * 12 + c) as f64);
        let slab = geometry.channel_in_readout_order(image.view(), 1);
        assert_eq!(slab[(0, 0)], 7.0);

        let mut rebuilt = Array2::<f64>::zeros((8, 12));
        for channel in 0..3 {
            let slab = geometry.channel_in_readout_order(image.view(), channel);
            geometry.store_channel(rebuilt.view_mut(), channel, &slab);
        }
        assert_eq!(rebuilt, image);
    }

    #[test]
    fn channel_tiling_mismatch_is_configuration_error() {
        let mut geometry = small_geometry();
        geometry.channel_width = 5;
        let error = geometry.validate().expect_err("bad tiling");
        assert_eq!(error.category(), CalibErrorCategory::InvalidConfiguration);
    }
}
